use std::fmt;

/// Purpose string bound to static dataset encryption keys.
pub const PURPOSE_STATIC_DATASET: &str = "static dataset encryption";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    ChainAccount,
    Encryption,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChainAccount => "eth_account",
            Self::Encryption => "encryption",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a derived key is bound to.
///
/// Two contexts that differ in any field yield unrelated keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyContext {
    kind: KeyKind,
    name: String,
    purpose: String,
}

impl KeyContext {
    pub fn new(kind: KeyKind, name: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            purpose: purpose.into(),
        }
    }

    /// Encryption key for a static dataset uploaded by `author`.
    pub fn static_dataset(author: impl Into<String>) -> Self {
        Self::new(KeyKind::Encryption, author, PURPOSE_STATIC_DATASET)
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// `kind/name`, with `/` in the name flattened so it stays one segment.
    pub fn path(&self) -> String {
        format!("{}/{}", self.kind, self.name.replace('/', "_"))
    }

    pub fn salt(&self) -> Vec<u8> {
        format!("{}:{}:{}", self.kind, self.name, self.purpose).into_bytes()
    }

    pub fn info(&self) -> Vec<u8> {
        format!(
            "purpose={},kind={},name={},version=1",
            self.purpose, self.kind, self.name
        )
        .into_bytes()
    }

    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.path(), self.purpose)
    }
}
