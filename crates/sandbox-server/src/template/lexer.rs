//! Tokenizer for the template expression language.

use super::TemplateError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    /// `/pattern/flags` regex literal.
    Regex(String, String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    StrictEq,
    StrictNotEq,
    AndAnd,
    OrOr,
    Question,
    Colon,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

impl Token {
    /// True when a following `/` starts a regex literal rather than a
    /// division.
    fn allows_regex(&self) -> bool {
        !matches!(
            self,
            Token::Num(_)
                | Token::Str(_)
                | Token::Ident(_)
                | Token::Regex(_, _)
                | Token::RParen
                | Token::RBracket
        )
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| TemplateError::Parse(format!("invalid number `{text}`")))?;
                tokens.push(Token::Num(n));
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    if i >= chars.len() {
                        return Err(TemplateError::Parse("unterminated string".into()));
                    }
                    let ch = chars[i];
                    if ch == quote {
                        i += 1;
                        break;
                    }
                    if ch == '\\' {
                        i += 1;
                        if i >= chars.len() {
                            return Err(TemplateError::Parse("unterminated escape".into()));
                        }
                        s.push(match chars[i] {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            '\\' => '\\',
                            '\'' => '\'',
                            '"' => '"',
                            '/' => '/',
                            other => other,
                        });
                        i += 1;
                    } else {
                        s.push(ch);
                        i += 1;
                    }
                }
                tokens.push(Token::Str(s));
            }
            'a'..='z' | 'A'..='Z' | '_' | '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '/' => {
                let regex_position = tokens.last().map(Token::allows_regex).unwrap_or(true);
                if regex_position {
                    i += 1;
                    let mut pattern = String::new();
                    let mut in_class = false;
                    loop {
                        if i >= chars.len() {
                            return Err(TemplateError::Parse("unterminated regex literal".into()));
                        }
                        let ch = chars[i];
                        if ch == '\\' {
                            pattern.push(ch);
                            i += 1;
                            if i < chars.len() {
                                pattern.push(chars[i]);
                                i += 1;
                            }
                            continue;
                        }
                        if ch == '[' {
                            in_class = true;
                        } else if ch == ']' {
                            in_class = false;
                        } else if ch == '/' && !in_class {
                            i += 1;
                            break;
                        }
                        pattern.push(ch);
                        i += 1;
                    }
                    let mut flags = String::new();
                    while i < chars.len() && chars[i].is_ascii_alphabetic() {
                        flags.push(chars[i]);
                        i += 1;
                    }
                    tokens.push(Token::Regex(pattern, flags));
                } else {
                    tokens.push(Token::Slash);
                    i += 1;
                }
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    if chars.get(i + 2) == Some(&'=') {
                        tokens.push(Token::StrictNotEq);
                        i += 3;
                    } else {
                        tokens.push(Token::NotEq);
                        i += 2;
                    }
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    if chars.get(i + 2) == Some(&'=') {
                        tokens.push(Token::StrictEq);
                        i += 3;
                    } else {
                        tokens.push(Token::EqEq);
                        i += 2;
                    }
                } else {
                    return Err(TemplateError::Parse("assignment is not supported".into()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(TemplateError::Parse("single `&` is not supported".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(TemplateError::Parse("single `|` is not supported".into()));
                }
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            other => {
                return Err(TemplateError::Parse(format!(
                    "unexpected character `{other}`"
                )));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_tokens() {
        let tokens = tokenize("1 + 2 * 3").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Num(1.0),
                Token::Plus,
                Token::Num(2.0),
                Token::Star,
                Token::Num(3.0),
            ]
        );
    }

    #[test]
    fn test_member_and_index() {
        let tokens = tokenize("req.headers['x-y']").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("req".into()),
                Token::Dot,
                Token::Ident("headers".into()),
                Token::LBracket,
                Token::Str("x-y".into()),
                Token::RBracket,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = tokenize(r#"'it\'s' + "a\nb""#).unwrap();
        assert_eq!(tokens[0], Token::Str("it's".into()));
        assert_eq!(tokens[2], Token::Str("a\nb".into()));
    }

    #[test]
    fn test_division_vs_regex() {
        assert_eq!(
            tokenize("6 / 2").unwrap(),
            vec![Token::Num(6.0), Token::Slash, Token::Num(2.0)]
        );
        let tokens = tokenize(r"/ab+c/i").unwrap();
        assert_eq!(tokens, vec![Token::Regex("ab+c".into(), "i".into())]);
    }

    #[test]
    fn test_regex_after_operator() {
        let tokens = tokenize(r"x && /a\/b/").unwrap();
        assert_eq!(tokens[2], Token::Regex("a/b".into(), String::new()));
    }

    #[test]
    fn test_comparison_operators() {
        let tokens = tokenize("a == b != c === d !== e <= f >= g").unwrap();
        assert!(tokens.contains(&Token::EqEq));
        assert!(tokens.contains(&Token::NotEq));
        assert!(tokens.contains(&Token::StrictEq));
        assert!(tokens.contains(&Token::StrictNotEq));
        assert!(tokens.contains(&Token::Le));
        assert!(tokens.contains(&Token::Ge));
    }

    #[test]
    fn test_rejects_assignment() {
        assert!(tokenize("a = 1").is_err());
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("'abc").is_err());
    }
}
