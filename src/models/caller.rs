use serde::{Deserialize, Serialize};

/// An already-authenticated caller.
///
/// The core never sees credentials. The HTTP layer resolves the bearer token or
/// device key to a name and passes the resulting `Caller` into every operation,
/// where it ends up in `recorded_by` / `opened_by` and in log spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub name: String,
}

impl Caller {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Caller used when authentication is disabled.
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
