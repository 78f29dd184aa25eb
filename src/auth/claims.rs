use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role carried in the token, issued by the auth service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "employee")]
    Worker,
    Supervisor,
    Admin,
    Superadmin,
}

impl Role {
    /// May approve, reject and correct entries, and read anyone's.
    pub fn can_review(&self) -> bool {
        matches!(self, Role::Supervisor | Role::Admin | Role::Superadmin)
    }

    /// May create and edit job sites and print their QR codes.
    pub fn can_manage_sites(&self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }
}

/// JWT payload used for authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,      // user ID
    pub role: Role,
    pub iat: usize,     // issued at (unix timestamp)
    pub exp: usize,     // expires at (unix timestamp)
    pub iss: String,    // issuer
    pub aud: String,    // audience
}
