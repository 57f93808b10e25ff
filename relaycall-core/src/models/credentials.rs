use serde::{Deserialize, Serialize};

/// Identity used to open the signaling connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    /// Participant id of the local user, when the app knows it
    pub id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
}

// Keep the key out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("email", &self.email)
            .finish()
    }
}
