use serde::{Deserialize, Serialize};

use crate::validation::ValidationErrors;

const FILL_ALL_FIELDS: &str = "Please fill in all fields";

/// The signed-in user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Email/password pair submitted by the sign-in screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.email.trim().is_empty() {
            errors.add("email", FILL_ALL_FIELDS);
        }
        if self.password.is_empty() {
            errors.add("password", FILL_ALL_FIELDS);
        }
        errors.into_result()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
}

impl SignUpRequest {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = match Credentials::new(&self.email, &self.password).validate() {
            Ok(()) => ValidationErrors::default(),
            Err(errors) => errors,
        };
        if self.display_name.trim().is_empty() {
            errors.add("display_name", FILL_ALL_FIELDS);
        }
        errors.into_result()
    }
}
