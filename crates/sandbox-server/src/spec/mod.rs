//! OpenAPI document loading, operation descriptors, and path matching.

mod loader;
mod operation;
mod path;

pub use loader::ApiSpec;
pub use operation::{
    select_json_media, synthesize_operation_id, Operation, ParamLocation, ParameterSpec,
    ResponseSpec,
};
pub use path::PathTemplate;
