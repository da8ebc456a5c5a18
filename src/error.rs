use std::fmt;

#[derive(Debug)]
pub enum AppError {
    BroadcastNotFound(String),
    SessionNotFound(String),
    MediaAccess(String),
    Throw(String),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn broadcast_not_found<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::BroadcastNotFound(t.to_string())
    }

    pub fn session_not_found<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::SessionNotFound(t.to_string())
    }

    pub fn media_access<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::MediaAccess(t.to_string())
    }

    pub fn throw<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::Throw(t.to_string())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BroadcastNotFound(err) => write!(f, "broadcast not found: {}", err),
            AppError::SessionNotFound(err) => write!(f, "session not found: {}", err),
            AppError::MediaAccess(err) => write!(f, "media access: {}", err),
            AppError::Throw(err) => write!(f, "{}", err),
            AppError::InternalServerError(err) => write!(f, "{}", err),
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError::InternalServerError(err.into())
    }
}
