//! Netscape cookie-jar serialisation, the format git understands through
//! its `http.cookieFile` option.

use std::io;

use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct JarCookie {
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub expires: Option<OffsetDateTime>,
    pub name: String,
    pub value: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CookieLineError {
    #[error("cookie has no domain")]
    MissingDomain,
    #[error("cookie has no expiration time")]
    MissingExpires,
    #[error("cookie has no name")]
    MissingName,
    #[error("cookie has no value")]
    MissingValue,
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn bool_str(value: bool) -> &'static str {
    if value { "TRUE" } else { "FALSE" }
}

/// One tab-separated line per cookie: domain, include-subdomains, path,
/// secure, unix expiry, name, value.
pub fn write_cookie<W: io::Write>(writer: &mut W, cookie: &JarCookie) -> Result<(), CookieLineError> {
    if cookie.domain.is_empty() {
        return Err(CookieLineError::MissingDomain);
    }

    let expires = cookie.expires.ok_or(CookieLineError::MissingExpires)?;

    if cookie.name.is_empty() {
        return Err(CookieLineError::MissingName);
    }

    if cookie.value.is_empty() {
        return Err(CookieLineError::MissingValue);
    }

    let path = if cookie.path.is_empty() { "/" } else { &cookie.path };

    writeln!(
        writer,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        cookie.domain,
        bool_str(false),
        path,
        bool_str(cookie.secure),
        expires.unix_timestamp(),
        cookie.name,
        cookie.value,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie() -> JarCookie {
        JarCookie {
            domain: "example.org".to_owned(),
            path: String::new(),
            secure: false,
            expires: Some(OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("timestamp")),
            name: "auth".to_owned(),
            value: "opaque-token".to_owned(),
        }
    }

    #[test]
    fn writes_a_tab_separated_line() {
        let mut buffer = Vec::new();
        write_cookie(&mut buffer, &cookie()).expect("write");

        assert_eq!(
            String::from_utf8(buffer).expect("utf-8"),
            "example.org\tFALSE\t/\tFALSE\t1700000000\tauth\topaque-token\n"
        );
    }

    #[test]
    fn secure_cookies_are_flagged() {
        let mut buffer = Vec::new();
        let mut cookie = cookie();
        cookie.secure = true;
        cookie.path = "/git".to_owned();

        write_cookie(&mut buffer, &cookie).expect("write");

        assert_eq!(
            String::from_utf8(buffer).expect("utf-8"),
            "example.org\tFALSE\t/git\tTRUE\t1700000000\tauth\topaque-token\n"
        );
    }

    #[test]
    fn missing_required_fields_are_errors() {
        let mut buffer = Vec::new();

        let mut no_domain = cookie();
        no_domain.domain = String::new();
        assert!(matches!(
            write_cookie(&mut buffer, &no_domain),
            Err(CookieLineError::MissingDomain)
        ));

        let mut no_expires = cookie();
        no_expires.expires = None;
        assert!(matches!(
            write_cookie(&mut buffer, &no_expires),
            Err(CookieLineError::MissingExpires)
        ));

        let mut no_name = cookie();
        no_name.name = String::new();
        assert!(matches!(
            write_cookie(&mut buffer, &no_name),
            Err(CookieLineError::MissingName)
        ));

        let mut no_value = cookie();
        no_value.value = String::new();
        assert!(matches!(
            write_cookie(&mut buffer, &no_value),
            Err(CookieLineError::MissingValue)
        ));
    }
}
