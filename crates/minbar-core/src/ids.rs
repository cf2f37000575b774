use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// User and session ids arrive from outside the system as plain UUIDs; only
// ids minted internally are branded.
branded_id!(AskId, "ask");
branded_id!(StreamMsgId, "msg");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_id_has_prefix() {
        let id = AskId::new();
        assert!(id.as_str().starts_with("ask_"), "got: {id}");
    }

    #[test]
    fn stream_msg_id_has_prefix() {
        let id = StreamMsgId::new();
        assert!(id.as_str().starts_with("msg_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = AskId::new();
        let b = AskId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = AskId::new();
        let s = id.to_string();
        let parsed: AskId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = StreamMsgId::from_raw("custom-id-9");
        assert_eq!(id.as_str(), "custom-id-9");
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<AskId> = (0..100).map(|_| AskId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
