//! `${env:VAR}` and `~` expansion for configuration values.

use std::env;

/// Expand a leading `~` or `~/` to the user's home directory.
///
/// Uses `$HOME` on Unix and `%USERPROFILE%` on Windows. `~user` forms and
/// inputs without a home directory are returned unchanged.
pub fn expand_tilde(input: &str) -> String {
    let Some(rest) = input.strip_prefix('~') else {
        return input.to_string();
    };
    if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\')) {
        return input.to_string();
    }

    #[cfg(windows)]
    let home = env::var("USERPROFILE").ok();
    #[cfg(not(windows))]
    let home = env::var("HOME").ok();

    match home {
        Some(home) => format!("{home}{rest}"),
        None => input.to_string(),
    }
}

/// Replace `${env:NAME}` placeholders with the value of `NAME`.
///
/// Unset variables and unterminated placeholders are left as written.
pub fn expand_env_placeholders(input: &str) -> String {
    const OPEN: &str = "${env:";

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let placeholder = &rest[start..start + OPEN.len() + end + 1];
        match env::var(&after[..end]) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(placeholder),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Expand placeholders, then a leading `~`.
pub fn expand_path(input: &str) -> String {
    expand_tilde(&expand_env_placeholders(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_set_variable() {
        env::set_var("FERRY_TEST_EXPAND_USER", "deploy");
        assert_eq!(
            expand_env_placeholders("${env:FERRY_TEST_EXPAND_USER}@host"),
            "deploy@host"
        );
        env::remove_var("FERRY_TEST_EXPAND_USER");
    }

    #[test]
    fn leaves_unset_variable() {
        let input = "${env:FERRY_TEST_DEFINITELY_UNSET_VAR}";
        assert_eq!(expand_env_placeholders(input), input);
    }

    #[test]
    fn leaves_unterminated_placeholder() {
        assert_eq!(expand_env_placeholders("a${env:OPEN"), "a${env:OPEN");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(expand_env_placeholders("/srv/www"), "/srv/www");
        assert_eq!(expand_tilde("/srv/www"), "/srv/www");
    }

    #[test]
    fn tilde_user_is_not_expanded() {
        assert_eq!(expand_tilde("~root/x"), "~root/x");
    }

    #[cfg(unix)]
    #[test]
    fn tilde_slash_expands_to_home() {
        let Ok(home) = env::var("HOME") else {
            return;
        };
        assert_eq!(expand_tilde("~/.ssh/id_ed25519"), format!("{home}/.ssh/id_ed25519"));
        assert_eq!(expand_tilde("~"), home);
    }
}
