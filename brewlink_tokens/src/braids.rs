use aliri_braid::braid;
use std::fmt;

/// Formats secrets as a placeholder unless the alternate flag is given
///
/// The alternate form of `Debug` shows a quoted prefix of `$prefix`
/// characters, or as many as the formatter's width asks for. The alternate
/// form of `Display` shows the whole value unless a width is given.
macro_rules! redacted {
    ($ty:ty: $label:literal, $prefix:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                Redaction {
                    label: concat!("***", $label, "***"),
                    prefix: $prefix,
                    quoted: true,
                }
                .write(&self.0, f)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                Redaction {
                    label: concat!("***", $label, "***"),
                    prefix: usize::MAX,
                    quoted: false,
                }
                .write(&self.0, f)
            }
        }
    };
}

struct Redaction {
    label: &'static str,
    prefix: usize,
    quoted: bool,
}

impl Redaction {
    fn write(&self, secret: &str, f: &mut fmt::Formatter) -> fmt::Result {
        if !f.alternate() {
            return f.write_str(self.label);
        }

        let quote = if self.quoted { "\"" } else { "" };
        let shown = f.width().unwrap_or(self.prefix);
        let cut = shown
            .checked_sub(1)
            .and_then(|n| secret.char_indices().nth(n))
            .map(|(idx, _)| idx);

        match cut {
            _ if shown <= 1 => write!(f, "{quote}…{quote}"),
            Some(idx) => write!(f, "{quote}{}…{quote}", &secret[..idx]),
            None => write!(f, "{quote}{secret}{quote}"),
        }
    }
}

/// The OAuth client ID of the application
#[braid(serde)]
pub struct ClientId;

/// The account name used for the password grant
#[braid(serde)]
pub struct Username;

/// The account password used for the password grant
#[braid(serde, debug = "owned", display = "owned")]
pub struct Password;

redacted!(PasswordRef: "PASSWORD", 0);

/// An access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "ACCESS TOKEN", 15);

/// An OpenID Connect ID token
///
/// The backend's REST and websocket endpoints authenticate with this token.
#[braid(serde, debug = "owned", display = "owned")]
pub struct IdToken;

redacted!(IdTokenRef: "ID TOKEN", 15);

/// A refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef: "REFRESH TOKEN", 5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_refresh_token() {
        let token = RefreshToken::from_static("v1.MTIzNDU2Nzg5MA");
        assert_eq!(format!("{:?}", token), "***REFRESH TOKEN***");
        assert_eq!(format!("{}", token), "***REFRESH TOKEN***");
    }

    #[test]
    fn alternate_debug_reveals_bounded_prefix() {
        let token = AccessToken::from_static("eyJhbGciOiJSUzI1NiJ9.payload.sig");
        assert_eq!(format!("{:#?}", token), "\"eyJhbGciOiJSUz…\"");
        assert_eq!(format!("{:#4?}", token), "\"eyJ…\"");
    }

    #[test]
    fn alternate_display_reveals_short_values_whole() {
        let token = IdToken::from_static("abc");
        assert_eq!(format!("{:#}", token), "abc");
    }

    #[test]
    fn password_never_reveals_by_default() {
        let password = Password::from_static("hunter2");
        assert_eq!(format!("{:#?}", password), "\"…\"");
    }
}
