//! Connection identity
//!
//! A [`ConnectionKey`] names one pooled broker link. Equality is structural
//! over every component, so a `:` or `|` inside an email or session id can
//! never make two tenants collide.

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// The user and session a connection is scoped to
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct TenantScope {
    user_email: Option<String>,
    session_id: Option<String>,
}

impl TenantScope {
    /// Empty or whitespace-only components count as absent
    pub fn new(user_email: Option<&str>, session_id: Option<&str>) -> Self {
        Self {
            user_email: normalize(user_email),
            session_id: normalize(session_id),
        }
    }

    pub fn user(email: &str) -> Self {
        Self::new(Some(email), None)
    }

    pub fn session(user_email: Option<&str>, session_id: &str) -> Self {
        Self::new(user_email, Some(session_id))
    }

    pub fn user_email(&self) -> Option<&str> {
        self.user_email.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_email.is_none() && self.session_id.is_none()
    }
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Identity of one pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionKey {
    host: String,
    port: u16,
    username: Option<String>,
    tenant: TenantScope,
}

impl ConnectionKey {
    /// Pure and total; a missing tenant scope is the shared anonymous scope
    pub fn resolve(
        host: &str,
        port: u16,
        username: Option<&str>,
        tenant: Option<TenantScope>,
    ) -> Self {
        Self {
            host: host.trim().to_string(),
            port,
            username: normalize(username),
            tenant: tenant.unwrap_or_default(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn tenant(&self) -> &TenantScope {
        &self.tenant
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Covers both user-only and user+session keys
    pub fn belongs_to_user(&self, email: &str) -> bool {
        self.tenant.user_email() == Some(email)
    }

    pub fn belongs_to_session(&self, session_id: &str) -> bool {
        self.tenant.session_id() == Some(session_id)
    }

    /// Client identifier presented to the broker
    ///
    /// Scoped keys get a stable identifier; fully anonymous keys get a fresh
    /// one per connection.
    pub fn client_id(&self, prefix: &str) -> String {
        match (self.tenant.user_email(), self.tenant.session_id()) {
            (Some(email), Some(session)) => format!("{email}_{session}"),
            (Some(email), None) => email.to_string(),
            (None, Some(session)) => format!("{prefix}_{session}"),
            (None, None) => format!("{prefix}_{}", Uuid::new_v4().simple()),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.username.as_deref().unwrap_or("anonymous"),
            self.endpoint()
        )?;
        if let Some(email) = self.tenant.user_email() {
            write!(f, " user={email}")?;
        }
        if let Some(session) = self.tenant.session_id() {
            write!(f, " session={session}")?;
        }
        Ok(())
    }
}
