/// Shared error type used across the application layer.
#[derive(Debug, thiserror::Error)]
pub enum MurmurError {
    #[error("not found")]
    NotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("session compromised")]
    SessionCompromised,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = MurmurError::NotFound;
        assert_eq!(err.to_string(), "not found");
    }

    #[test]
    fn validation_contains_message() {
        let err = MurmurError::Validation("bad input".into());
        assert_eq!(err.to_string(), "validation error: bad input");
    }

    #[test]
    fn session_compromised_display() {
        let err = MurmurError::SessionCompromised;
        assert_eq!(err.to_string(), "session compromised");
    }

    #[test]
    fn all_variants_impl_error() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(MurmurError::NotFound),
            Box::new(MurmurError::Validation("x".into())),
            Box::new(MurmurError::Internal("y".into())),
            Box::new(MurmurError::Crypto("z".into())),
            Box::new(MurmurError::SessionCompromised),
            Box::new(MurmurError::ServiceUnavailable("directory down".into())),
        ];
        for e in &errors {
            let _ = e.to_string();
        }
    }
}
