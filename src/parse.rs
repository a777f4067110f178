//! Parsers for the human readable output of `kadmin.local`.
//!
//! kadmin's formatting shifts between releases, so these only ever look for a
//! handful of stable substrings and ignore whitespace and everything else.

use std::collections::BTreeSet;
use tracing::{trace, warn};

const BANNER: &str = "Authenticating as principal";
const KEY_PREFIX: &str = "Key:";
const KVNO_TAG: &str = "vno";
const KEYTAB_ENTRY_PREFIX: &str = "Entry for principal ";
const KEYTAB_ENTRY_ADDED: &str = "added to keytab";

/// One key of a principal as reported by `get_principal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub kvno: u32,
    pub enctype: String,
}

/// Turns raw admin tool output into structured data. The engine only talks to
/// this trait so a different admin backend can bring its own parser.
pub trait OutputParser {
    /// Principal names in the order listed, without duplicates.
    fn parse_principal_list(&self, text: &str) -> Vec<String>;

    /// Keys in the order the tool reports them. That order is the canonical
    /// order for kvno record comparison.
    fn parse_principal_detail(&self, text: &str) -> Vec<KeyInfo>;

    fn parse_keytab_extraction(&self, text: &str) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KadminTextParser;

fn content_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(BANNER))
}

fn parse_key_line(line: &str) -> Option<KeyInfo> {
    let rest = line.strip_prefix(KEY_PREFIX)?.trim_start();
    let rest = rest.strip_prefix(KVNO_TAG)?;
    let mut fields = rest.split(',').map(str::trim);

    let kvno = match fields.next()?.parse::<u32>() {
        Ok(kvno) => kvno,
        Err(err) => {
            warn!(?err, ?line, "ignoring key line with an invalid kvno");
            return None;
        }
    };
    let enctype = fields.next().unwrap_or_default().to_string();

    Some(KeyInfo { kvno, enctype })
}

impl OutputParser for KadminTextParser {
    fn parse_principal_list(&self, text: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        content_lines(text)
            // Warnings and errors are interleaved with the listing on some versions.
            .filter(|line| line.contains('@') && !line.contains(char::is_whitespace))
            .filter(|line| seen.insert(*line))
            .map(str::to_string)
            .collect()
    }

    fn parse_principal_detail(&self, text: &str) -> Vec<KeyInfo> {
        let keys: Vec<_> = content_lines(text).filter_map(parse_key_line).collect();
        trace!(?keys);
        keys
    }

    fn parse_keytab_extraction(&self, text: &str) -> usize {
        content_lines(text)
            .filter(|line| {
                line.starts_with(KEYTAB_ENTRY_PREFIX) && line.contains(KEYTAB_ENTRY_ADDED)
            })
            .count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{KadminTextParser, KeyInfo, OutputParser};

    pub(crate) fn list_principals(realm: &str, principals: &[&str]) -> String {
        let mut out =
            format!("Authenticating as principal autokeytab/admin@{realm} with password.\n");
        for p in principals {
            out.push_str(p);
            out.push('\n');
        }
        out
    }

    pub(crate) fn get_principal(principal: &str, kvnos: &[u32]) -> String {
        let realm = principal.rsplit_once('@').map(|(_, r)| r).unwrap_or_default();
        let mut out = format!(
            "Authenticating as principal autokeytab/admin@{realm} with password.\n\
             Principal: {principal}\n\
             Expiration date: [never]\n\
             Last password change: Thu Jun 09 22:31:01 UTC 2016\n\
             Maximum ticket life: 1 day 00:00:00\n\
             Number of keys: {}\n",
            kvnos.len()
        );
        let enctypes = ["aes256-cts-hmac-sha1-96", "aes128-cts-hmac-sha1-96"];
        for (i, kvno) in kvnos.iter().enumerate() {
            out.push_str(&format!(
                "Key: vno {kvno}, {}, no salt\n",
                enctypes[i % enctypes.len()]
            ));
        }
        out.push_str("MKey: vno 1\nAttributes:\nPolicy: [none]\n");
        out
    }

    pub(crate) fn ktadd(principal: &str, kvnos: &[u32]) -> String {
        let name = principal.rsplit_once('@').map(|(n, _)| n).unwrap_or(principal);
        let mut out = String::from(
            "Authenticating as principal autokeytab/admin@TEST.REALM with password.\n",
        );
        for kvno in kvnos {
            out.push_str(&format!(
                "Entry for principal {name} with kvno {kvno}, \
                 encryption type aes256-cts-hmac-sha1-96 added to keytab WRFILE:test.keytab.\n"
            ));
        }
        out
    }

    #[test]
    fn test_parse_principal_list() {
        let text = "Authenticating as principal puppet_auto/admin@TEST.REALM with password.\n\
                    K/M@TEST.REALM\n\
                    host/foo.bar.baz@TEST.REALM\n\
                    nfs/foo.bar.baz@TEST.REALM\n\
                    puppet_auto/admin@TEST.REALM\n";

        let list = KadminTextParser.parse_principal_list(text);
        assert_eq!(
            list,
            vec![
                "K/M@TEST.REALM",
                "host/foo.bar.baz@TEST.REALM",
                "nfs/foo.bar.baz@TEST.REALM",
                "puppet_auto/admin@TEST.REALM",
            ]
        );
    }

    #[test]
    fn test_parse_principal_list_tolerates_noise() {
        let text = "  Authenticating as principal root/admin@TEST.REALM with password.\n\
                    \n\
                    WARNING: something happened here\n\
                    \thost/a.example.com@TEST.REALM   \n";

        let list = KadminTextParser.parse_principal_list(text);
        assert_eq!(list, vec!["host/a.example.com@TEST.REALM"]);
    }

    #[test]
    fn test_parse_principal_list_keeps_listing_order() {
        let text = "nfs/b.example.com@TEST.REALM\n\
                    host/a.example.com@TEST.REALM\n\
                    nfs/b.example.com@TEST.REALM\n\
                    K/M@TEST.REALM\n";

        let list = KadminTextParser.parse_principal_list(text);
        assert_eq!(
            list,
            vec![
                "nfs/b.example.com@TEST.REALM",
                "host/a.example.com@TEST.REALM",
                "K/M@TEST.REALM",
            ]
        );
    }

    #[test]
    fn test_parse_principal_detail() {
        let text = get_principal("host/foo.bar.baz@TEST.REALM", &[1, 1]);
        let keys = KadminTextParser.parse_principal_detail(&text);
        assert_eq!(
            keys,
            vec![
                KeyInfo {
                    kvno: 1,
                    enctype: "aes256-cts-hmac-sha1-96".to_string()
                },
                KeyInfo {
                    kvno: 1,
                    enctype: "aes128-cts-hmac-sha1-96".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_principal_detail_keeps_order() {
        let text = "Key: vno 3, aes128-cts-hmac-sha1-96\n\
                    Key:   vno 2, aes256-cts\n\
                    Key: vno 4,aes256-cts-hmac-sha384-192, no salt\n\
                    MKey: vno 1\n";
        let kvnos: Vec<u32> = KadminTextParser
            .parse_principal_detail(text)
            .iter()
            .map(|k| k.kvno)
            .collect();
        assert_eq!(kvnos, vec![3, 2, 4]);
    }

    #[test]
    fn test_parse_principal_detail_no_keys() {
        let text = "Authenticating as principal root/admin@TEST.REALM with password.\n\
                    get_principal: Principal does not exist while retrieving \"x@TEST.REALM\".\n";
        assert!(KadminTextParser.parse_principal_detail(text).is_empty());
    }

    #[test]
    fn test_parse_keytab_extraction() {
        let text = ktadd("host/foo.bar.baz@TEST.REALM", &[1, 1]);
        assert_eq!(KadminTextParser.parse_keytab_extraction(&text), 2);

        let failed = "Authenticating as principal root/admin@TEST.REALM with password.\n\
                      kadmin.local: Principal does not exist while changing \
                      host/x@TEST.REALM's key\n";
        assert_eq!(KadminTextParser.parse_keytab_extraction(failed), 0);
    }
}
