//! The `key=value` parameter syntax used on the command line.
//!
//! Values may be bare tokens, single- or double-quoted strings (quotes
//! stripped), or brace-delimited nested expressions (`{k=v k=v}`) parsed
//! recursively. Anything that does not parse is silently dropped.

use crate::value::{Value, ValueMap};

/// Parse every item of a list into one merged map.
pub fn parse_many<S: AsRef<str>>(items: &[S]) -> ValueMap {
    let mut merged = ValueMap::new();
    for item in items {
        merged.extend(parse(item.as_ref()));
    }
    merged
}

/// Parse a `k=v k=v` string into a map.
pub fn parse(data: &str) -> ValueMap {
    Parser { chars: data.chars().collect(), pos: 0 }.parse_pairs()
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn parse_pairs(&mut self) -> ValueMap {
        let mut pairs = ValueMap::new();

        while !self.at_end() {
            self.skip_whitespace();
            if self.at_end() {
                break;
            }

            match self.parse_pair() {
                Some((key, value)) => {
                    pairs.insert(key, value);
                }
                None => self.skip_token(),
            }
        }

        pairs
    }

    fn parse_pair(&mut self) -> Option<(String, Value)> {
        let key = self.take_while(|c| c.is_alphanumeric() || c == '_');
        if key.is_empty() || self.peek() != Some('=') {
            return None;
        }
        self.pos += 1;

        let value = match self.peek()? {
            '{' => Value::Map(self.parse_nested()?),
            quote @ ('"' | '\'') => Value::Str(self.parse_quoted(quote)?),
            _ => {
                let bare = self.take_while(|c| !c.is_whitespace());
                if bare.is_empty() {
                    return None;
                }
                Value::Str(bare)
            }
        };

        Some((key, value))
    }

    /// `{...}` with balanced inner braces, recursively parsed.
    fn parse_nested(&mut self) -> Option<ValueMap> {
        let start = self.pos + 1;
        let mut depth = 0usize;
        let mut pos = self.pos;
        while pos < self.chars.len() {
            match self.chars[pos] {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let inner: String = self.chars[start..pos].iter().collect();
                        self.pos = pos + 1;
                        return Some(parse(&inner));
                    }
                }
                _ => {}
            }
            pos += 1;
        }
        None
    }

    fn parse_quoted(&mut self, quote: char) -> Option<String> {
        let start = self.pos + 1;
        let mut pos = start;
        while pos < self.chars.len() {
            if self.chars[pos] == quote {
                let inner: String = self.chars[start..pos].iter().collect();
                self.pos = pos + 1;
                return Some(inner);
            }
            pos += 1;
        }
        None
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.pos < self.chars.len() && keep(self.chars[self.pos]) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    /// Drop everything up to the next whitespace.
    fn skip_token(&mut self) {
        while matches!(self.peek(), Some(c) if !c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_quoted_and_nested_values() {
        let parsed = parse(r#"a=1 b="hello world" c={x=1 y=2}"#);

        assert_eq!(parsed.get("a"), Some(&Value::from("1")));
        assert_eq!(parsed.get("b"), Some(&Value::from("hello world")));
        let nested = parsed.get("c").and_then(Value::as_map).unwrap();
        assert_eq!(nested.get("x"), Some(&Value::from("1")));
        assert_eq!(nested.get("y"), Some(&Value::from("2")));
    }

    #[test]
    fn single_quotes_are_stripped_too() {
        let parsed = parse("msg='hi there'");
        assert_eq!(parsed.get("msg"), Some(&Value::from("hi there")));
    }

    #[test]
    fn nested_maps_recurse() {
        let parsed = parse("outer={inner={deep=yes}}");
        let deep = parsed
            .get("outer")
            .and_then(|v| v.get("inner"))
            .and_then(|v| v.get("deep"));
        assert_eq!(deep, Some(&Value::from("yes")));
    }

    #[test]
    fn unknown_syntax_is_silently_dropped() {
        let parsed = parse("good=1 =bad also-bad good2=2");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("good"), Some(&Value::from("1")));
        assert_eq!(parsed.get("good2"), Some(&Value::from("2")));
    }

    #[test]
    fn parse_many_merges_items() {
        let parsed = parse_many(&["a=1", "b=2 c=3"]);
        assert_eq!(parsed.len(), 3);
    }
}
