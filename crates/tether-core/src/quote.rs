//! POSIX shell quoting for command strings sent over exec channels.
//!
//! Exec channels carry a single command line with no structured argument
//! passing, so every fragment interpolated into a remote command goes
//! through [`shell_quote`].

/// Quote `s` as a single POSIX shell word.
///
/// The result is wrapped in single quotes; embedded single quotes become
/// `'\''` (close, escaped quote, reopen).
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_word() {
        assert_eq!(shell_quote("mosh-server"), "'mosh-server'");
    }

    #[test]
    fn empty_word() {
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn embedded_single_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn metacharacters_are_inert() {
        assert_eq!(shell_quote("$(rm -rf ~); `id`"), "'$(rm -rf ~); `id`'");
    }
}
