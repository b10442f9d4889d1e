//! Metric key parsing.
//!
//! A metric key is a name optionally followed by a bracketed parameter list,
//! for example `vfs.file.size[/var/log/syslog,bytes]`. Parameters can be
//! unquoted, double-quoted (with `\"` escapes) or a one-level array such as
//! `[a,b]`, which is kept verbatim.

use thiserror::Error;

/// Errors produced while parsing a metric key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Invalid item key format: empty key name")]
    EmptyName,

    #[error("Invalid item key format: unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("Invalid item key format: unterminated quoted parameter")]
    UnterminatedQuote,

    #[error("Invalid item key format: missing closing bracket")]
    UnterminatedParams,

    #[error("Invalid item key format: nested arrays are not allowed")]
    NestedArray,
}

/// Returns true for characters allowed in a key name.
pub fn is_key_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')
}

/// Split a metric key into its name and parameters.
pub fn parse_key(key: &str) -> Result<(String, Vec<String>), KeyError> {
    let name_end = key.find(|c: char| !is_key_char(c)).unwrap_or(key.len());
    if name_end == 0 {
        return Err(KeyError::EmptyName);
    }
    let name = key[..name_end].to_string();
    let rest = &key[name_end..];
    if rest.is_empty() {
        return Ok((name, Vec::new()));
    }
    if !rest.starts_with('[') {
        return Err(unexpected(key, name_end));
    }

    let chars: Vec<(usize, char)> = key.char_indices().skip(name_end + 1).collect();
    let mut params = Vec::new();
    let mut i = 0;

    loop {
        // skip leading spaces
        while i < chars.len() && chars[i].1 == ' ' {
            i += 1;
        }
        let Some(&(pos, ch)) = chars.get(i) else {
            return Err(KeyError::UnterminatedParams);
        };

        let param = match ch {
            '"' => {
                let (param, next) = parse_quoted(&chars, i + 1)?;
                i = next;
                // only spaces may follow the closing quote
                while i < chars.len() && chars[i].1 == ' ' {
                    i += 1;
                }
                param
            }
            '[' => {
                let start = i;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(KeyError::UnterminatedParams),
                        Some((_, '[')) => return Err(KeyError::NestedArray),
                        Some((_, ']')) => break,
                        Some((_, '"')) => {
                            let (_, next) = parse_quoted(&chars, i + 1)?;
                            i = next;
                        }
                        Some(_) => i += 1,
                    }
                }
                i += 1;
                let end = chars.get(i).map(|(p, _)| *p).unwrap_or(key.len());
                key[chars[start].0..end].to_string()
            }
            _ => {
                let start = pos;
                while i < chars.len() && !matches!(chars[i].1, ',' | ']') {
                    i += 1;
                }
                let end = chars.get(i).map(|(p, _)| *p).unwrap_or(key.len());
                key[start..end].to_string()
            }
        };
        params.push(param);

        match chars.get(i) {
            Some((_, ',')) => i += 1,
            Some((_, ']')) => {
                i += 1;
                break;
            }
            Some(&(pos, ch)) => return Err(KeyError::UnexpectedChar { ch, pos }),
            None => return Err(KeyError::UnterminatedParams),
        }
    }

    if let Some(&(pos, ch)) = chars.get(i) {
        return Err(KeyError::UnexpectedChar { ch, pos });
    }

    Ok((name, params))
}

/// Parse a quoted parameter starting right after the opening quote.
/// Returns the unescaped text and the index following the closing quote.
fn parse_quoted(chars: &[(usize, char)], mut i: usize) -> Result<(String, usize), KeyError> {
    let mut out = String::new();
    loop {
        match chars.get(i) {
            None => return Err(KeyError::UnterminatedQuote),
            Some((_, '\\')) if matches!(chars.get(i + 1), Some((_, '"'))) => {
                out.push('"');
                i += 2;
            }
            Some((_, '"')) => return Ok((out, i + 1)),
            Some(&(_, ch)) => {
                out.push(ch);
                i += 1;
            }
        }
    }
}

fn unexpected(key: &str, pos: usize) -> KeyError {
    let ch = key[pos..].chars().next().unwrap_or(' ');
    KeyError::UnexpectedChar { ch, pos }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_plain_key() {
        let (name, p) = parse_key("agent.ping").unwrap();
        assert_eq!(name, "agent.ping");
        assert!(p.is_empty());
    }

    #[test]
    fn test_parse_key_with_params() {
        let (name, p) = parse_key("vfs.file.size[/var/log/syslog,bytes]").unwrap();
        assert_eq!(name, "vfs.file.size");
        assert_eq!(p, params(&["/var/log/syslog", "bytes"]));
    }

    #[test]
    fn test_parse_empty_params() {
        assert_eq!(parse_key("debug[]").unwrap().1, params(&[""]));
        assert_eq!(parse_key("debug[,]").unwrap().1, params(&["", ""]));
    }

    #[test]
    fn test_parse_quoted_params() {
        let (_, p) = parse_key(r#"log["a, b", "say \"hi\""]"#).unwrap();
        assert_eq!(p, params(&["a, b", r#"say "hi""#]));
    }

    #[test]
    fn test_parse_array_param() {
        let (_, p) = parse_key("net.if[[eth0,eth1],in]").unwrap();
        assert_eq!(p, params(&["[eth0,eth1]", "in"]));
    }

    #[test]
    fn test_leading_spaces_are_skipped() {
        let (_, p) = parse_key("key[a, b]").unwrap();
        assert_eq!(p, params(&["a", "b"]));
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!(parse_key(""), Err(KeyError::EmptyName));
        assert_eq!(parse_key("[a]"), Err(KeyError::EmptyName));
        assert!(matches!(
            parse_key("key a"),
            Err(KeyError::UnexpectedChar { ch: ' ', .. })
        ));
        assert_eq!(parse_key("key[a"), Err(KeyError::UnterminatedParams));
        assert_eq!(parse_key(r#"key["a]"#), Err(KeyError::UnterminatedQuote));
        assert_eq!(parse_key("key[[[a]]]"), Err(KeyError::NestedArray));
        assert!(matches!(
            parse_key("key[a]b"),
            Err(KeyError::UnexpectedChar { ch: 'b', .. })
        ));
        assert!(matches!(
            parse_key(r#"key["a" b]"#),
            Err(KeyError::UnexpectedChar { ch: 'b', .. })
        ));
    }
}
