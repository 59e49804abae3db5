//! Deterministic fake-data surface.
//!
//! A fixed list of generators addressed by dotted path (`name.firstName`,
//! `internet.email`, ...). Every draw consumes the shared seeded stream,
//! so the surface is fully deterministic for a given seed.

use super::rng::SeededRng;
use chrono::{TimeZone, Utc};
use serde_json::Value;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Grace", "Edsger", "Barbara", "Donald", "Hedy", "Linus", "Margaret", "Niklaus",
    "Radia", "Dennis", "Frances", "Guido", "Katherine", "Ken", "Leslie", "Shafi", "Tim", "Yukihiro",
];

const LAST_NAMES: &[&str] = &[
    "Lovelace", "Turing", "Hopper", "Dijkstra", "Liskov", "Knuth", "Lamarr", "Torvalds",
    "Hamilton", "Wirth", "Perlman", "Ritchie", "Allen", "Rossum", "Johnson", "Thompson",
    "Lamport", "Goldwasser", "Lee", "Matsumoto",
];

const CITIES: &[&str] = &[
    "Lisbon", "Oslo", "Kyoto", "Austin", "Zurich", "Porto", "Tallinn", "Vancouver", "Seoul",
    "Cork", "Helsinki", "Bologna", "Gdansk", "Quito", "Wellington",
];

const COUNTRIES: &[&str] = &[
    "Portugal", "Norway", "Japan", "Switzerland", "Estonia", "Canada", "Ireland", "Finland",
    "Italy", "Poland", "Ecuador", "New Zealand", "Brazil", "Kenya", "Vietnam",
];

const STREET_SUFFIXES: &[&str] = &["Street", "Avenue", "Lane", "Road", "Way", "Terrace"];

const COMPANY_STEMS: &[&str] = &[
    "Acme", "Globex", "Initech", "Umbra", "Vortex", "Nimbus", "Quanta", "Helix", "Solstice",
    "Meridian",
];

const COMPANY_SUFFIXES: &[&str] = &["Labs", "Systems", "Industries", "Group", "Works", "Dynamics"];

const PRODUCT_ADJECTIVES: &[&str] = &[
    "Sleek", "Rustic", "Ergonomic", "Compact", "Durable", "Refined", "Modular", "Handcrafted",
];

const PRODUCT_MATERIALS: &[&str] = &["Steel", "Wooden", "Cotton", "Granite", "Ceramic", "Copper"];

const PRODUCT_NOUNS: &[&str] = &[
    "Chair", "Lamp", "Keyboard", "Bottle", "Notebook", "Backpack", "Clock", "Mug",
];

const EMAIL_DOMAINS: &[&str] = &["example.com", "example.org", "example.net", "mail.test"];

const URL_SCHEMES: &[&str] = &["https", "http"];

/// Invoke a generator by dotted path. Returns `None` for unknown paths.
/// `now_ms` anchors the date generators to the request's fixed clock.
pub fn invoke(rng: &mut SeededRng, path: &str, now_ms: i64) -> Option<Value> {
    let value = match path {
        "name.firstName" => Value::from(*rng.pick(FIRST_NAMES)),
        "name.lastName" => Value::from(*rng.pick(LAST_NAMES)),
        "name.fullName" => {
            let first = *rng.pick(FIRST_NAMES);
            let last = *rng.pick(LAST_NAMES);
            Value::from(format!("{first} {last}"))
        }
        "internet.email" => {
            let first = rng.pick(FIRST_NAMES).to_lowercase();
            let last = rng.pick(LAST_NAMES).to_lowercase();
            let domain = *rng.pick(EMAIL_DOMAINS);
            Value::from(format!("{first}.{last}@{domain}"))
        }
        "internet.userName" => {
            let first = rng.pick(FIRST_NAMES).to_lowercase();
            let n = rng.int_between(1, 999);
            Value::from(format!("{first}{n}"))
        }
        "internet.url" => {
            let scheme = *rng.pick(URL_SCHEMES);
            let stem = rng.pick(COMPANY_STEMS).to_lowercase();
            let domain = *rng.pick(EMAIL_DOMAINS);
            Value::from(format!("{scheme}://{stem}.{domain}"))
        }
        "address.city" => Value::from(*rng.pick(CITIES)),
        "address.country" => Value::from(*rng.pick(COUNTRIES)),
        "address.zipCode" => Value::from(format!("{:05}", rng.int_between(10000, 99999))),
        "address.streetAddress" => {
            let number = rng.int_between(1, 9999);
            let name = *rng.pick(LAST_NAMES);
            let suffix = *rng.pick(STREET_SUFFIXES);
            Value::from(format!("{number} {name} {suffix}"))
        }
        "company.name" | "company.companyName" => {
            let stem = *rng.pick(COMPANY_STEMS);
            let suffix = *rng.pick(COMPANY_SUFFIXES);
            Value::from(format!("{stem} {suffix}"))
        }
        "commerce.productName" => {
            let adj = *rng.pick(PRODUCT_ADJECTIVES);
            let material = *rng.pick(PRODUCT_MATERIALS);
            let noun = *rng.pick(PRODUCT_NOUNS);
            Value::from(format!("{adj} {material} {noun}"))
        }
        "commerce.price" => {
            let cents = rng.int_between(100, 100_000);
            serde_json::Number::from_f64(cents as f64 / 100.0)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        "random.number" => Value::from(rng.int_between(0, 100_000)),
        "random.boolean" => Value::from(rng.chance(0.5)),
        "random.uuid" => Value::from(rng.uuid()),
        "date.recent" => iso_offset(now_ms, -rng.int_between(0, 10 * 86_400_000)),
        "date.future" => iso_offset(now_ms, rng.int_between(86_400_000, 90 * 86_400_000)),
        _ => return None,
    };
    Some(value)
}

fn iso_offset(now_ms: i64, offset_ms: i64) -> Value {
    match Utc.timestamp_millis_opt(now_ms + offset_ms) {
        chrono::LocalResult::Single(dt) => Value::from(dt.to_rfc3339()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_deterministic_for_same_seed() {
        let mut a = SeededRng::from_seed_str("seed");
        let mut b = SeededRng::from_seed_str("seed");
        for path in [
            "name.firstName",
            "internet.email",
            "address.city",
            "commerce.price",
            "random.uuid",
        ] {
            assert_eq!(invoke(&mut a, path, NOW), invoke(&mut b, path, NOW));
        }
    }

    #[test]
    fn test_unknown_path_returns_none() {
        let mut rng = SeededRng::new(1);
        assert_eq!(invoke(&mut rng, "name.nickName", NOW), None);
        assert_eq!(invoke(&mut rng, "bogus", NOW), None);
    }

    #[test]
    fn test_email_shape() {
        let mut rng = SeededRng::new(3);
        let email = invoke(&mut rng, "internet.email", NOW).unwrap();
        let email = email.as_str().unwrap();
        assert!(email.contains('@'), "not an email: {email}");
        assert!(email.chars().all(|c| !c.is_uppercase()));
    }

    #[test]
    fn test_recent_date_is_before_now() {
        let mut rng = SeededRng::new(5);
        let recent = invoke(&mut rng, "date.recent", NOW).unwrap();
        let parsed = chrono::DateTime::parse_from_rfc3339(recent.as_str().unwrap()).unwrap();
        assert!(parsed.timestamp_millis() <= NOW);
    }

    #[test]
    fn test_future_date_is_after_now() {
        let mut rng = SeededRng::new(5);
        let future = invoke(&mut rng, "date.future", NOW).unwrap();
        let parsed = chrono::DateTime::parse_from_rfc3339(future.as_str().unwrap()).unwrap();
        assert!(parsed.timestamp_millis() > NOW);
    }

    #[test]
    fn test_price_has_at_most_two_decimals() {
        let mut rng = SeededRng::new(9);
        let price = invoke(&mut rng, "commerce.price", NOW).unwrap();
        let price = price.as_f64().unwrap();
        let cents = price * 100.0;
        assert!((cents - cents.round()).abs() < 1e-9);
    }
}
