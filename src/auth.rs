use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::{MAX_ACCOUNT_LEN, MAX_DEPARTMENT_NAME_LEN};

/// Shared-password gateway. The startup `user` is the account id and the
/// startup `database` is the department; both must be present.
#[derive(Debug)]
pub struct RoombookAuthSource {
    password: String,
}

impl RoombookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

fn reject(reason: &str) -> PgWireError {
    metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
    tracing::info!(target: "access", route = "login", granted = false, reason, "login rejected");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "FATAL".into(),
        "28000".into(),
        reason.into(),
    )))
}

#[async_trait]
impl AuthSource for RoombookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        match login.user() {
            Some(user) if !user.is_empty() && user.len() <= MAX_ACCOUNT_LEN => {}
            _ => return Err(reject("a valid account id is required as user")),
        }
        match login.database() {
            Some(db) if !db.is_empty() && db.len() <= MAX_DEPARTMENT_NAME_LEN => {}
            _ => return Err(reject("a department is required as database")),
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
