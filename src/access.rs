//! Allow/deny and Basic-auth decisions against a [`Config`].

use std::borrow::Cow;
use std::net::IpAddr;
use std::path::Path;

use crate::config::{Action, Config};
use crate::crypt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No rule covers the path.
    NotRequired,
    Authorized { user: String },
    Unauthorized,
}

/// Is `addr` allowed to connect? The first matching rule decides.
pub fn check_ip(config: &Config, addr: IpAddr) -> bool {
    let ip = match addr {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    };
    if let Some(ip) = ip {
        if let Some(rule) = config.ip_rules.iter().find(|rule| rule.matches(ip)) {
            return rule.action == Action::Allow;
        }
    }
    !config.deny_all
}

/// Does the auth rule `prefix` cover `path`? The prefix must end on a segment boundary.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    path.starts_with(prefix)
        && (prefix.len() == 1 || matches!(path.as_bytes().get(prefix.len()), None | Some(b'/')))
}

/// Check `credentials` (decoded `user:password`) for `path`.
///
/// Only the rules sharing the longest matching prefix are considered; any of them may
/// authenticate the request.
pub fn check_auth(config: &Config, path: &str, credentials: Option<&str>) -> AuthOutcome {
    let mut matched: Option<&str> = None;
    for rule in &config.auth_rules {
        if let Some(prefix) = matched {
            if rule.prefix != prefix {
                continue;
            }
        } else if !prefix_matches(&rule.prefix, path) {
            continue;
        }
        matched = Some(&rule.prefix);

        let (user, password) = match credentials.and_then(|c| c.split_once(':')) {
            Some(credentials) => credentials,
            None => return AuthOutcome::Unauthorized,
        };
        if rule.user != user {
            continue;
        }
        let accepted = match &rule.password {
            Some(stored) if crypt::is_md5_hash(stored) => crypt::verify(password, stored),
            Some(stored) => stored == password,
            None => false,
        };
        if accepted {
            return AuthOutcome::Authorized {
                user: user.to_string(),
            };
        }
    }
    if matched.is_some() {
        AuthOutcome::Unauthorized
    } else {
        AuthOutcome::NotRequired
    }
}

/// Walk the directories on `path`, merging in each one's own config file, and report whether
/// `addr` is still allowed. Stops at the first directory that denies.
///
/// The merged config lives only as long as the request that produced it.
pub fn scope_for_request<'a>(
    config: &'a Config,
    root: &Path,
    path: &str,
    addr: IpAddr,
) -> (Cow<'a, Config>, bool) {
    let mut config = Cow::Borrowed(config);
    let mut allowed = check_ip(&config, addr);
    for (index, _) in path.match_indices('/').filter(|&(index, _)| index > 0) {
        if !allowed {
            break;
        }
        let subdir = &path[1..index];
        if !root.join(subdir).is_dir() {
            continue;
        }
        if let Some(merged) = config.for_subdir(root, subdir) {
            allowed = check_ip(&merged, addr);
            config = Cow::Owned(merged);
        }
    }
    (config, allowed)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::{create_dir_all, write};
    use std::net::Ipv6Addr;

    use tempfile::tempdir;
    use test_case::test_case;

    use crate::config::{ParseMode, CONFIG_FILE_NAME};

    fn parse(text: &str) -> Config {
        Config::default()
            .parse_reader(text.as_bytes(), ParseMode::First)
            .unwrap()
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test_case("10.1.2.3", true ; "inside allowed network")]
    #[test_case("10.255.255.255", true ; "edge of allowed network")]
    #[test_case("192.168.1.1", false ; "outside")]
    #[test_case("::ffff:10.0.0.1", true ; "mapped v4")]
    #[test_case("::1", false ; "plain v6")]
    fn allow_network_then_deny_all(addr: &str, allowed: bool) {
        let config = parse("A:10.0.0.0/8\nD:*\n");
        assert_eq!(check_ip(&config, ip(addr)), allowed);
    }

    #[test]
    fn deny_wins_over_earlier_allow() {
        let config = parse("A:10.0.0.0/8\nA:10.1.2.3\nD:10.1.0.0/16\n");
        assert!(!check_ip(&config, ip("10.1.2.3")));
        assert!(check_ip(&config, ip("10.2.0.1")));
    }

    #[test]
    fn no_rules_allows_everyone() {
        assert!(check_ip(&Config::default(), ip("192.0.2.1")));
        assert!(!check_ip(&parse("D:*\n"), ip("192.0.2.1")));
    }

    #[test_case("/adm", "/adm", true ; "exact")]
    #[test_case("/adm", "/adm/x", true ; "below")]
    #[test_case("/adm", "/admin", false ; "not a segment boundary")]
    #[test_case("/adm", "/ad", false ; "shorter")]
    #[test_case("/", "/anything", true ; "root covers everything")]
    fn prefix_matches_works(prefix: &str, path: &str, expected: bool) {
        assert_eq!(prefix_matches(prefix, path), expected);
    }

    #[test_case("/adm/x", Some("admin:setup"), AuthOutcome::Authorized { user: "admin".into() } ; "right password")]
    #[test_case("/adm/x", Some("admin:wrong"), AuthOutcome::Unauthorized ; "wrong password")]
    #[test_case("/adm/x", Some("Admin:setup"), AuthOutcome::Unauthorized ; "user is case sensitive")]
    #[test_case("/adm/x", Some("adminsetup"), AuthOutcome::Unauthorized ; "no colon")]
    #[test_case("/adm/x", None, AuthOutcome::Unauthorized ; "no credentials")]
    #[test_case("/adm/x", Some("toor:password"), AuthOutcome::Authorized { user: "toor".into() } ; "md5 password")]
    #[test_case("/adm/x", Some("toor:$1$saltsalt$qjXMvbEw8oaL.CzflDtaK/"), AuthOutcome::Unauthorized ; "hash is not a password")]
    #[test_case("/public/x", None, AuthOutcome::NotRequired ; "unprotected path")]
    #[test_case("/administrator", None, AuthOutcome::NotRequired ; "prefix of a longer name")]
    fn check_auth_works(path: &str, credentials: Option<&str>, expected: AuthOutcome) {
        let config = parse(
            "/adm:admin:setup\n\
             /adm:toor:$1$saltsalt$qjXMvbEw8oaL.CzflDtaK/\n",
        );
        assert_eq!(check_auth(&config, path, credentials), expected);
    }

    #[test]
    fn longest_prefix_group_decides() {
        let config = parse("/:root:toor\n/adm:admin:setup\n/nopass:user\n");
        // the root rule does not help under /adm
        assert_eq!(
            check_auth(&config, "/adm/x", Some("root:toor")),
            AuthOutcome::Unauthorized
        );
        assert_eq!(
            check_auth(&config, "/other", Some("root:toor")),
            AuthOutcome::Authorized {
                user: "root".into()
            }
        );
        assert_eq!(
            check_auth(&config, "/nopass", Some("user:")),
            AuthOutcome::Unauthorized
        );
    }

    #[test]
    fn subdirectory_configs_are_merged() {
        let root = tempdir().unwrap();
        create_dir_all(root.path().join("adm/deep")).unwrap();
        create_dir_all(root.path().join("private")).unwrap();
        create_dir_all(root.path().join("open")).unwrap();
        write(root.path().join("adm").join(CONFIG_FILE_NAME), "/x:u:p\n").unwrap();
        write(
            root.path().join("private").join(CONFIG_FILE_NAME),
            "D:127.0.0.1\n",
        )
        .unwrap();
        let top = parse("/top:t:t\n");

        let (config, allowed) =
            scope_for_request(&top, root.path(), "/adm/deep/file", ip("127.0.0.1"));
        assert!(allowed);
        assert_eq!(
            check_auth(&config, "/adm/x", None),
            AuthOutcome::Unauthorized
        );
        assert_eq!(check_auth(&config, "/top", None), AuthOutcome::Unauthorized);

        let (_, allowed) = scope_for_request(&top, root.path(), "/private/", ip("127.0.0.1"));
        assert!(!allowed);
        let (_, allowed) = scope_for_request(&top, root.path(), "/private/", ip("127.0.0.2"));
        assert!(allowed);

        let (config, allowed) =
            scope_for_request(&top, root.path(), "/open/file", ip("127.0.0.1"));
        assert!(allowed);
        assert!(matches!(config, Cow::Borrowed(_)));

        // a denied address never gets as far as the subdirectories
        let denied = parse("D:*\n");
        let (config, allowed) =
            scope_for_request(&denied, root.path(), "/adm/x", ip("127.0.0.1"));
        assert!(!allowed);
        assert!(config.auth_rules.is_empty());

        let (_, allowed) = scope_for_request(&top, root.path(), "/", IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(allowed);
    }
}
