//! Late-binding placeholders in inventory files.
//!
//! Values in inventory YAML may be tagged (`!env`, `!prompt`,
//! `!env_or_prompt`). Tags are never evaluated at load time so that an
//! unused prompt never fires; [`resolve`] walks a tree and replaces every
//! placeholder just before dispatch.

use std::env;
use std::fmt::{self, Display, Formatter};
use std::io::IsTerminal;

use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueError};

const MASKED_TRIGGERS: &[&str] = &["secret", "password", "pass", "key", "masked"];
const U_PADLOCK: &str = "\u{1f512}";

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("unknown tag `{0}`")]
    Unknown(String),

    #[error("malformed `{tag}` tag: {reason}")]
    Malformed { tag: String, reason: String },

    #[error("cannot prompt for `{0}` in non-interactive mode")]
    NotInteractive(String),

    #[error("prompt failed: {0}")]
    Prompt(#[from] dialoguer::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tag {
    /// `!env NAME`: value of the environment variable or the empty string.
    Env { name: String },
    /// `!prompt text` / `!prompt [text, {masked: true}]`: read a line from
    /// the controlling terminal.
    Prompt { text: String, masked: bool },
    /// `!env_or_prompt NAME`: environment variable if set, prompt
    /// otherwise. `masked` is inferred from the variable name when not
    /// given explicitly.
    EnvOrPrompt {
        name: String,
        text: String,
        masked: bool,
    },
}

impl Tag {
    pub fn from_yaml(node: &serde_yaml::value::TaggedValue) -> Result<Tag, ValueError> {
        let tag = node.tag.to_string();
        Self::parse(&tag, &node.value)
            .map_err(|err| ValueError::UnsupportedYaml(err.to_string()))
    }

    fn parse(tag: &str, node: &serde_yaml::Value) -> Result<Tag, TagError> {
        let (arg, options) = split_tag_args(tag, node)?;

        match tag.trim_start_matches('!') {
            "env" => Ok(Tag::Env { name: arg }),
            "prompt" => Ok(Tag::Prompt {
                text: arg,
                masked: options
                    .as_ref()
                    .and_then(|opts| opts.get("masked"))
                    .and_then(serde_yaml::Value::as_bool)
                    .unwrap_or(false),
            }),
            "env_or_prompt" => {
                let masked = match options.as_ref().and_then(|opts| opts.get("masked")) {
                    Some(value) => value.as_bool().unwrap_or(false),
                    // Assume masking for safety based on a trigger word.
                    None => {
                        let basis = arg.to_lowercase();
                        MASKED_TRIGGERS.iter().any(|trigger| basis.contains(trigger))
                    }
                };
                let text = options
                    .as_ref()
                    .and_then(|opts| opts.get("prompt"))
                    .and_then(serde_yaml::Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("Value for {arg}?"));

                Ok(Tag::EnvOrPrompt { name: arg, text, masked })
            }
            other => Err(TagError::Unknown(other.to_owned())),
        }
    }

    fn resolve(&self, resolver: &TagResolver) -> Result<Value, TagError> {
        match self {
            Tag::Env { name } => Ok(Value::Str(env::var(name).unwrap_or_default())),
            Tag::Prompt { text, masked } => {
                resolver.prompt(text, *masked).map(Value::Str)
            }
            Tag::EnvOrPrompt { name, text, masked } => match env::var(name) {
                Ok(value) => Ok(Value::Str(value)),
                Err(_) => resolver.prompt(text, *masked).map(Value::Str),
            },
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Env { name } => write!(f, "!env {name}"),
            Tag::Prompt { text, masked } => write!(f, "!prompt {text:?} (masked={masked})"),
            Tag::EnvOrPrompt { name, .. } => write!(f, "!env_or_prompt {name}"),
        }
    }
}

/// Tags accept either a bare scalar argument or a `[argument, {options}]`
/// sequence.
fn split_tag_args(
    tag: &str,
    node: &serde_yaml::Value,
) -> Result<(String, Option<serde_yaml::Mapping>), TagError> {
    match node {
        serde_yaml::Value::String(s) => Ok((s.clone(), None)),
        serde_yaml::Value::Sequence(items) => match items.as_slice() {
            [serde_yaml::Value::String(arg)] => {
                info!(
                    "single-argument tag declarations can be bare strings - try `{tag} '{arg}'`"
                );
                Ok((arg.clone(), None))
            }
            [serde_yaml::Value::String(arg), serde_yaml::Value::Mapping(options)] => {
                Ok((arg.clone(), Some(options.clone())))
            }
            _ => Err(TagError::Malformed {
                tag: tag.to_owned(),
                reason: "expected `argument` or `[argument, {options}]`".into(),
            }),
        },
        other => Err(TagError::Malformed {
            tag: tag.to_owned(),
            reason: format!("unsupported node {other:?}"),
        }),
    }
}

/// Evaluates placeholders, prompting on the controlling terminal when
/// allowed to.
#[derive(Debug, Clone)]
pub struct TagResolver {
    interactive: bool,
}

impl Default for TagResolver {
    fn default() -> Self {
        TagResolver { interactive: std::io::stdin().is_terminal() }
    }
}

impl TagResolver {
    pub fn non_interactive() -> Self {
        TagResolver { interactive: false }
    }

    fn prompt(&self, text: &str, masked: bool) -> Result<String, TagError> {
        if !self.interactive {
            return Err(TagError::NotInteractive(text.to_owned()));
        }

        if masked {
            let text = format!("{U_PADLOCK} {text} (masked)");
            Ok(dialoguer::Password::new().with_prompt(text).interact()?)
        } else {
            Ok(dialoguer::Input::<String>::new()
                .with_prompt(text)
                .interact_text()?)
        }
    }
}

/// Deep-copy `value` with every placeholder evaluated. Walks maps, lists
/// and sets; scalar leaves pass through untouched.
pub fn resolve(value: &Value, resolver: &TagResolver) -> Result<Value, TagError> {
    match value {
        Value::Tagged(tag) => tag.resolve(resolver),
        Value::List(items) => Ok(Value::List(resolve_seq(items, resolver)?)),
        Value::Set(items) => Ok(Value::Set(resolve_seq(items, resolver)?)),
        Value::Map(map) => {
            let mut out = crate::value::ValueMap::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve(item, resolver)?);
            }
            Ok(Value::Map(out))
        }
        scalar => Ok(scalar.clone()),
    }
}

fn resolve_seq(items: &[Value], resolver: &TagResolver) -> Result<Vec<Value>, TagError> {
    items.iter().map(|item| resolve(item, resolver)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_tag_resolves_from_environment() {
        std::env::set_var("FROG_TAG_TEST", "shhh");
        let tag = Tag::Env { name: "FROG_TAG_TEST".into() };
        let value = tag.resolve(&TagResolver::non_interactive()).unwrap();
        assert_eq!(value, Value::from("shhh"));
    }

    #[test]
    fn env_tag_defaults_to_empty() {
        let tag = Tag::Env { name: "FROG_TAG_TEST_UNSET".into() };
        let value = tag.resolve(&TagResolver::non_interactive()).unwrap();
        assert_eq!(value, Value::from(""));
    }

    #[test]
    fn env_or_prompt_prefers_environment() {
        std::env::set_var("FROG_TAG_SECRET", "hunter2");
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("password: !env_or_prompt FROG_TAG_SECRET").unwrap();
        let value = Value::from_yaml(&yaml).unwrap();
        let resolved = resolve(&value, &TagResolver::non_interactive()).unwrap();
        assert_eq!(resolved.get("password"), Some(&Value::from("hunter2")));
    }

    #[test]
    fn env_or_prompt_infers_masking() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("v: !env_or_prompt API_PASSWORD").unwrap();
        let value = Value::from_yaml(&yaml).unwrap();
        match value.get("v") {
            Some(Value::Tagged(Tag::EnvOrPrompt { masked, .. })) => assert!(masked),
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn unset_env_fails_cleanly_without_terminal() {
        let tag = Tag::EnvOrPrompt {
            name: "FROG_TAG_TEST_UNSET".into(),
            text: "Value for FROG_TAG_TEST_UNSET?".into(),
            masked: false,
        };
        let err = tag.resolve(&TagResolver::non_interactive()).unwrap_err();
        assert!(matches!(err, TagError::NotInteractive(_)));
    }
}
