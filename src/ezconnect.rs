//! Translation of easy-connect URLs into long-form descriptor text
//!
//! The abbreviated syntax is
//!
//! ```text
//! [[protocol:]//]host1[,host2;host3][:port][/service_name][:server_mode]
//!     [/instance_name][?key1=value1&key2=value2...]
//! ```
//!
//! Hosts separated by `,` load-balance within one group; `;` starts a new
//! group which becomes a nested `ADDRESS_LIST`. Query keys are aliases for
//! the long-form parameter names and are matched case-insensitively.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::error::{Error, Result};

/// Query keys that land in the DESCRIPTION node rather than CONNECT_DATA
/// or SECURITY
const DESCRIPTION_PARAMS: &[&str] = &[
    "ENABLE",
    "FAILOVER",
    "LOAD_BALANCE",
    "RECV_BUF_SIZE",
    "SEND_BUF_SIZE",
    "SDU",
    "SOURCE_ROUTE",
    "RETRY_COUNT",
    "RETRY_DELAY",
    "CONNECT_TIMEOUT",
    "TRANSPORT_CONNECT_TIMEOUT",
    "RECV_TIMEOUT",
];

/// Lowercased query key to long-form parameter name
const URL_PROP_ALIASES: &[(&str, &str)] = &[
    ("enable", "ENABLE"),
    ("failover", "FAILOVER"),
    ("load_balance", "LOAD_BALANCE"),
    ("recv_buf_size", "RECV_BUF_SIZE"),
    ("send_buf_size", "SEND_BUF_SIZE"),
    ("sdu", "SDU"),
    ("source_route", "SOURCE_ROUTE"),
    ("retry_count", "RETRY_COUNT"),
    ("retry_delay", "RETRY_DELAY"),
    ("https_proxy", "HTTPS_PROXY"),
    ("https_proxy_port", "HTTPS_PROXY_PORT"),
    ("connect_timeout", "CONNECT_TIMEOUT"),
    ("transport_connect_timeout", "TRANSPORT_CONNECT_TIMEOUT"),
    ("recv_timeout", "RECV_TIMEOUT"),
    ("ssl_server_cert_dn", "SSL_SERVER_CERT_DN"),
    ("ssl_server_dn_match", "SSL_SERVER_DN_MATCH"),
    ("wallet_location", "MY_WALLET_DIRECTORY"),
    ("pool_connection_class", "POOL_CONNECTION_CLASS"),
    ("pool_purity", "POOL_PURITY"),
    ("service_tag", "SERVICE_TAG"),
    ("connection_id_prefix", "CONNECTION_ID_PREFIX"),
];

const HOST: &str = r"(\[[A-Za-z0-9:]+\]|[A-Za-z0-9][A-Za-z0-9._-]*)";

// This engine runs in linear time, so host-list fragments cannot trigger
// pathological backtracking regardless of how the alternation is written.
static HOSTNAMES_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?P<hostnames>({HOST},?)+)(:(?P<port>\d+))?"
    ))
    .unwrap()
});

static EZ_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let host_info = format!(r"(?P<hostinfo>(({HOST},?)+(:\d+)?[,;]?)+)");
    let service = r"(/(?P<servicename>[A-Za-z0-9][A-Za-z0-9_,.-]*)?)?";
    let mode = r"(:(?P<servermode>dedicated|shared|pooled))?";
    let instance = r"(/(?P<instance>[A-Za-z0-9]+))?";
    Regex::new(&format!(
        r"(?i)^((?P<protocol>[A-Za-z0-9]+):)?(//)?{host_info}{service}{mode}{instance}$"
    ))
    .unwrap()
});

/// Expand an easy-connect URL to long-form descriptor text.
///
/// Input already written as a descriptor (leading `(`) passes through
/// unchanged. When the URL names exactly one non-literal host, the host is
/// resolved once up front so an unknown name fails fast instead of after
/// the full retry schedule.
pub async fn translate(url: &str) -> Result<String> {
    let trimmed = url.trim();
    if trimmed.starts_with('(') {
        return Ok(trimmed.to_string());
    }
    let mut resolver = EzResolver::default();
    let bare = resolver.strip_extended_settings(trimmed)?;
    let out = resolver.resolve(&bare)?;
    if let Some((host, port)) = resolver.single_unresolved_host {
        if tokio::net::lookup_host((host.as_str(), port))
            .await
            .map(|mut addrs| addrs.next().is_none())
            .unwrap_or(true)
        {
            return Err(Error::UnresolvableHost(host));
        }
    }
    Ok(out)
}

#[derive(Default)]
struct EzResolver {
    /// insertion-ordered so emitted parameters follow the URL
    url_props: Vec<(String, String)>,
    lb: bool,
    naddr: usize,
    single_unresolved_host: Option<(String, u16)>,
}

impl EzResolver {
    fn prop(&self, key: &str) -> Option<&str> {
        self.url_props
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn resolve(&mut self, url: &str) -> Result<String> {
        let compact: String = url.chars().filter(|c| !c.is_whitespace()).collect();
        let caps = EZ_URL_PATTERN
            .captures(&compact)
            .ok_or_else(|| Error::InvalidConnectString(compact.clone()))?;

        let protocol = match caps.name("protocol") {
            Some(p) => {
                let p = p.as_str();
                if !p.eq_ignore_ascii_case("tcp") && !p.eq_ignore_ascii_case("tcps") {
                    return Err(Error::InvalidConnectString(format!(
                        "unsupported protocol {p}"
                    )));
                }
                p.to_uppercase()
            }
            None => "TCP".to_string(),
        };
        let host_info = caps
            .name("hostinfo")
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| Error::InvalidConnectString(compact.clone()))?;
        let service_name = caps.name("servicename").map(|m| m.as_str().to_string());
        let server_mode = caps.name("servermode").map(|m| m.as_str().to_string());
        let instance = caps.name("instance").map(|m| m.as_str().to_string());

        let address_info = self.build_address_list(&host_info, &protocol);

        let mut parts = String::new();
        if self.lb {
            parts.push_str("(LOAD_BALANCE=ON)");
        }
        parts.push_str(&self.build_description_params());
        parts.push_str(&address_info);
        parts.push_str(&self.build_connect_data(
            service_name.as_deref(),
            server_mode.as_deref(),
            instance.as_deref(),
        ));
        parts.push_str(&self.build_security_info(&protocol));
        Ok(format!("(DESCRIPTION={parts})"))
    }

    fn build_address_list(&mut self, host_info: &str, protocol: &str) -> String {
        let proxy_info = match (self.prop("HTTPS_PROXY"), self.prop("HTTPS_PROXY_PORT")) {
            (Some(host), Some(port)) => {
                format!("(HTTPS_PROXY={host})(HTTPS_PROXY_PORT={port})")
            }
            (Some(host), None) => format!("(HTTPS_PROXY={host})"),
            (None, _) => String::new(),
        };

        let groups: Vec<&str> = host_info.split(';').collect();
        let mut builder = String::new();
        let mut last_host: Option<(String, u16)> = None;
        for group in &groups {
            let mut group_count = 0;
            let mut addresses = String::new();
            for caps in HOSTNAMES_PATTERN.captures_iter(group) {
                let port = caps
                    .name("port")
                    .and_then(|m| m.as_str().parse::<u16>().ok())
                    .unwrap_or(1521);
                for host in caps["hostnames"].split(',') {
                    let host = host.trim();
                    if host.is_empty() {
                        continue;
                    }
                    // IPv6 literals drop the enclosing brackets
                    let host = host.trim_start_matches('[').trim_end_matches(']');
                    addresses.push_str(&format!(
                        "(ADDRESS=(PROTOCOL={protocol})(HOST={host})(PORT={port}){proxy_info})"
                    ));
                    last_host = Some((host.to_string(), port));
                    group_count += 1;
                }
            }
            self.naddr += group_count;
            if groups.len() > 1 {
                let lb = if group_count > 1 { "(LOAD_BALANCE=ON)" } else { "" };
                builder.push_str(&format!("(ADDRESS_LIST={lb}{addresses})"));
            } else {
                builder.push_str(&addresses);
            }
        }
        if groups.len() < 2 && self.naddr > 1 {
            self.lb = true;
        }
        if self.naddr == 1 {
            if let Some((host, port)) = last_host {
                if host.parse::<IpAddr>().is_err() {
                    self.single_unresolved_host = Some((host, port));
                }
            }
        }
        builder
    }

    fn build_description_params(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.url_props {
            if DESCRIPTION_PARAMS.contains(&key.as_str()) {
                out.push_str(&format!("({key}={value})"));
            }
        }
        out
    }

    fn build_connect_data(
        &self,
        service_name: Option<&str>,
        server_mode: Option<&str>,
        instance: Option<&str>,
    ) -> String {
        let mut parts = String::new();
        // a missing service name still emits the empty parameter so the
        // listener applies its default service
        match service_name {
            Some(name) => parts.push_str(&format!("(SERVICE_NAME={name})")),
            None => parts.push_str("(SERVICE_NAME=)"),
        }
        if let Some(mode) = server_mode {
            parts.push_str(&format!("(SERVER={mode})"));
        }
        if let Some(instance) = instance {
            parts.push_str(&format!("(INSTANCE_NAME={instance})"));
        }
        for key in [
            "POOL_CONNECTION_CLASS",
            "POOL_PURITY",
            "SERVICE_TAG",
            "CONNECTION_ID_PREFIX",
        ] {
            if let Some(value) = self.prop(key) {
                parts.push_str(&format!("({key}={value})"));
            }
        }
        format!("(CONNECT_DATA={parts})")
    }

    fn build_security_info(&self, protocol: &str) -> String {
        if !protocol.eq_ignore_ascii_case("tcps") {
            return String::new();
        }
        let mut parts = String::new();
        for key in ["SSL_SERVER_DN_MATCH", "SSL_SERVER_CERT_DN", "MY_WALLET_DIRECTORY"] {
            if let Some(value) = self.prop(key) {
                parts.push_str(&format!("({key}={value})"));
            }
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("(SECURITY={parts})")
        }
    }

    /// Split off a trailing `?key=value&...` section, recording its
    /// parameters, and return the bare URL. The `?` only counts at paren
    /// depth zero so descriptor-style values pass through.
    fn strip_extended_settings(&mut self, url: &str) -> Result<String> {
        let chars: Vec<char> = url.chars().collect();
        let mut depth = 0i32;
        let mut split_at = None;
        for (i, &c) in chars.iter().enumerate() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                '?' if depth == 0 => {
                    split_at = Some(i);
                    break;
                }
                _ => {}
            }
        }
        let Some(idx) = split_at else {
            return Ok(url.to_string());
        };
        self.parse_extended_properties(&chars[idx + 1..], url)?;
        Ok(chars[..idx].iter().collect())
    }

    fn parse_extended_properties(&mut self, chars: &[char], url: &str) -> Result<()> {
        let mut key: Option<String> = None;
        let mut token = String::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                i += 1;
                continue;
            }
            match c {
                // quoted values keep separators verbatim, quotes excluded
                '"' => {
                    i += 1;
                    while i < chars.len() && chars[i] != '"' {
                        token.push(chars[i]);
                        i += 1;
                    }
                }
                '=' => {
                    if key.is_some() {
                        return Err(Error::InvalidConnectString(url.to_string()));
                    }
                    key = Some(token.trim().to_string());
                    token.clear();
                }
                '&' => {
                    let Some(k) = key.take() else {
                        return Err(Error::InvalidConnectString(url.to_string()));
                    };
                    self.add_param(&k, token.trim());
                    token.clear();
                }
                _ => token.push(c),
            }
            i += 1;
        }
        if let Some(k) = key {
            self.add_param(&k, token.trim());
        }
        Ok(())
    }

    fn add_param(&mut self, key: &str, value: &str) {
        let lowered = key.to_lowercase();
        match URL_PROP_ALIASES
            .iter()
            .find(|(alias, _)| *alias == lowered)
        {
            Some((_, canonical)) => {
                self.url_props
                    .push((canonical.to_string(), value.to_string()));
            }
            None => debug!(key, "ignoring unrecognized easy-connect parameter"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_sync(url: &str) -> Result<String> {
        let mut resolver = EzResolver::default();
        let bare = resolver.strip_extended_settings(url.trim())?;
        resolver.resolve(&bare)
    }

    #[test]
    fn single_host_with_service() {
        let out = resolve_sync("db.example.com:1522/orclpdb").unwrap();
        assert_eq!(
            out,
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST=db.example.com)(PORT=1522))(CONNECT_DATA=(SERVICE_NAME=orclpdb)))"
        );
    }

    #[test]
    fn default_port_and_empty_service() {
        let out = resolve_sync("dbhost").unwrap();
        assert_eq!(
            out,
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST=dbhost)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=)))"
        );
    }

    #[test]
    fn tcps_two_hosts_load_balances() {
        let out = resolve_sync("tcps://db1.example.com,db2.example.com:1522/svc").unwrap();
        assert!(out.starts_with("(DESCRIPTION=(LOAD_BALANCE=ON)"));
        assert!(out.contains("(ADDRESS=(PROTOCOL=TCPS)(HOST=db1.example.com)(PORT=1522))"));
        assert!(out.contains("(ADDRESS=(PROTOCOL=TCPS)(HOST=db2.example.com)(PORT=1522))"));
        assert!(out.contains("(SERVICE_NAME=svc)"));
    }

    #[test]
    fn semicolon_groups_become_address_lists() {
        let out = resolve_sync("h1,h2:1522;h3:1523/svc").unwrap();
        assert!(out.contains(
            "(ADDRESS_LIST=(LOAD_BALANCE=ON)(ADDRESS=(PROTOCOL=TCP)(HOST=h1)(PORT=1522))(ADDRESS=(PROTOCOL=TCP)(HOST=h2)(PORT=1522)))"
        ));
        assert!(out.contains("(ADDRESS_LIST=(ADDRESS=(PROTOCOL=TCP)(HOST=h3)(PORT=1523)))"));
        // global load-balance tag only applies to a single group
        assert!(!out.starts_with("(DESCRIPTION=(LOAD_BALANCE=ON)"));
    }

    #[test]
    fn server_mode_and_instance() {
        let out = resolve_sync("dbhost/svc:pooled/inst1").unwrap();
        assert!(out.contains("(CONNECT_DATA=(SERVICE_NAME=svc)(SERVER=pooled)(INSTANCE_NAME=inst1))"));
    }

    #[test]
    fn extended_settings_reach_description_and_security() {
        let out = resolve_sync(
            "tcps://dbhost:1522/svc?retry_count=3&retry_delay=2&ssl_server_dn_match=TRUE&wallet_location=\"/opt/wallet\"",
        )
        .unwrap();
        assert!(out.contains("(RETRY_COUNT=3)"));
        assert!(out.contains("(RETRY_DELAY=2)"));
        assert!(out.contains("(SECURITY=(SSL_SERVER_DN_MATCH=TRUE)(MY_WALLET_DIRECTORY=/opt/wallet))"));
    }

    #[test]
    fn dn_match_override_lands_in_security() {
        let out = resolve_sync("tcps://host1,host2:1522/svc?ssl_server_dn_match=false").unwrap();
        assert!(out.contains("(ADDRESS=(PROTOCOL=TCPS)(HOST=host1)(PORT=1522))"));
        assert!(out.contains("(ADDRESS=(PROTOCOL=TCPS)(HOST=host2)(PORT=1522))"));
        assert!(out.contains("(CONNECT_DATA=(SERVICE_NAME=svc))"));
        assert!(out.contains("(SECURITY=(SSL_SERVER_DN_MATCH=false))"));
    }

    #[test]
    fn proxy_settings_attach_to_each_address() {
        let out =
            resolve_sync("tcps://dbhost/svc?https_proxy=proxy.example.com&https_proxy_port=8080")
                .unwrap();
        assert!(out.contains(
            "(ADDRESS=(PROTOCOL=TCPS)(HOST=dbhost)(PORT=1521)(HTTPS_PROXY=proxy.example.com)(HTTPS_PROXY_PORT=8080))"
        ));
    }

    #[test]
    fn ipv6_literal_brackets_removed() {
        let out = resolve_sync("[::1]:1521/svc").unwrap();
        assert!(out.contains("(ADDRESS=(PROTOCOL=TCP)(HOST=::1)(PORT=1521))"));
    }

    #[test]
    fn quoted_value_spans_separators() {
        let mut resolver = EzResolver::default();
        let bare = resolver
            .strip_extended_settings("dbhost/svc?connection_id_prefix=\"a=b&c\"")
            .unwrap();
        assert_eq!(bare, "dbhost/svc");
        assert_eq!(resolver.prop("CONNECTION_ID_PREFIX"), Some("a=b&c"));
    }

    #[test]
    fn rejects_non_url_input() {
        assert!(matches!(
            resolve_sync("not a url at all !!!"),
            Err(Error::InvalidConnectString(_))
        ));
        assert!(matches!(
            resolve_sync("ldap://dbhost/svc"),
            Err(Error::InvalidConnectString(_))
        ));
    }

    #[test]
    fn descriptor_input_passes_through() {
        let text = "(DESCRIPTION=(ADDRESS=(HOST=h)(PORT=1521)))";
        let out = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(translate(text))
            .unwrap();
        assert_eq!(out, text);
    }

    #[test]
    fn unresolvable_single_host_fails() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(translate("no-such-host.invalid/svc"))
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvableHost(_)));
    }
}
