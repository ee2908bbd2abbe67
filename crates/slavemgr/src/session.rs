//! Interactive session queries.

/// Environment variable overriding the interactive user.
pub const INTERACTIVE_USER_ENV: &str = "SLAVEMGR_INTERACTIVE_USER";

/// Answers "who is logged on to the interactive session right now".
pub trait InteractiveSession: Send + Sync {
    /// Name of the logged-on user, or None when the session shows a login screen.
    fn logged_on_user(&self) -> Option<String>;
}

/// Reads the session user from the environment.
///
/// `SLAVEMGR_INTERACTIVE_USER` wins; otherwise `USER`, then `LOGNAME`. An
/// empty value means nobody is logged on.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSession;

impl InteractiveSession for SystemSession {
    fn logged_on_user(&self) -> Option<String> {
        let lookup = |key: &str| std::env::var(key).ok();
        user_from(lookup)
    }
}

fn user_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    let name = match lookup(INTERACTIVE_USER_ENV) {
        Some(name) => name,
        None => lookup("USER").or_else(|| lookup("LOGNAME"))?,
    };
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Fixed answer, for embedding applications that track sessions themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    user: Option<String>,
}

impl StaticSession {
    pub fn logged_on(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
        }
    }

    pub fn nobody() -> Self {
        Self { user: None }
    }
}

impl InteractiveSession for StaticSession {
    fn logged_on_user(&self) -> Option<String> {
        self.user.clone().filter(|u| !u.is_empty())
    }
}
