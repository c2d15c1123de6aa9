/// Maximum size for a single plaintext message in bytes.
pub const MAX_MESSAGE_SIZE_BYTES: usize = 8 * 1024;
/// Maximum length for user display names.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_length_constants_positive() {
        assert!(MAX_MESSAGE_SIZE_BYTES > 0);
        assert!(MAX_DISPLAY_NAME_LENGTH > 0);
    }
}
