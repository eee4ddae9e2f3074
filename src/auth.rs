use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Single shared password for every user and tenant. Who may do what is
/// decided outside this server.
#[derive(Debug)]
pub struct ExambookAuthSource {
    password: String,
}

impl ExambookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ExambookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("password check for {login:?}");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
