//! Walking a parsed descriptor tree into concrete connect options
//!
//! A descriptor is a tree of DESCRIPTION_LIST / DESCRIPTION / ADDRESS_LIST /
//! ADDRESS nodes. Navigation flattens it into [`ConnectionDescription`]s,
//! each holding the connect options to try for that description, in the
//! order dictated by the FAILOVER / LOAD_BALANCE settings at every level.
//! Each option carries the descriptor text to replay to the server, rebuilt
//! fragment by fragment along the path that produced it.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use tracing::debug;

use crate::descriptor::NvPair;
use crate::error::{Error, Result};

const SOURCE_ROUTE_FRAGMENT: &str = "(SOURCE_ROUTE=yes)";
const HOP_COUNT_FRAGMENT: &str = "(HOP_COUNT=0)";
const CONNECT_DATA_OPEN: &str = "(CONNECT_DATA=";

/// Parameters hoisted from a DESCRIPTION node onto every option under it
#[derive(Debug, Clone, Default)]
pub struct DescriptionParams {
    pub connect_timeout: Option<Duration>,
    pub transport_connect_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub sdu: Option<u32>,
    /// keepalive probe interval, minutes
    pub expire_time: Option<u32>,
    pub enable: Option<String>,
    pub ssl_server_cert_dn: Option<String>,
    pub ssl_server_dn_match: Option<bool>,
    pub wallet_location: Option<String>,
    pub connection_id_prefix: Option<String>,
}

/// One concrete place to try connecting, with the descriptor text to send
#[derive(Debug, Clone)]
pub struct ConnectOption {
    pub protocol: String,
    /// host name as written in the descriptor
    pub hostname: String,
    /// resolved address, absent when resolution was skipped or failed
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub https_proxy: Option<String>,
    pub https_proxy_port: Option<u16>,
    /// descriptor fragments accumulated along the navigation path
    cn_data: Vec<String>,
    /// source ADDRESS text, for diagnostics
    pub address_text: String,
    done: bool,
}

impl ConnectOption {
    /// Text replayed as the connect payload for this option
    pub fn connect_data(&self) -> String {
        self.cn_data.concat()
    }
}

/// All options produced by one DESCRIPTION, plus its retry schedule
#[derive(Debug, Clone, Default)]
pub struct ConnectionDescription {
    pub retry_count: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub params: DescriptionParams,
    pub options: Vec<ConnectOption>,
}

/// Parsed descriptor tree prepared for navigation
#[derive(Debug)]
pub enum DescriptorNode {
    Address(Address),
    AddressList(AddressList),
    Description(Description),
    DescriptionList(DescriptionList),
}

#[derive(Debug)]
pub struct Address {
    protocol: String,
    host: String,
    port: u16,
    https_proxy: Option<String>,
    https_proxy_port: Option<u16>,
    text: String,
}

#[derive(Debug)]
pub struct AddressList {
    children: Vec<DescriptorNode>,
    source_route: bool,
    load_balance: bool,
    failover: bool,
}

#[derive(Debug)]
pub struct Description {
    children: Vec<DescriptorNode>,
    source_route: bool,
    load_balance: bool,
    failover: bool,
    retry_count: Option<u32>,
    retry_delay: Option<Duration>,
    connect_data: Option<String>,
    params: DescriptionParams,
}

#[derive(Debug)]
pub struct DescriptionList {
    children: Vec<Description>,
    load_balance: bool,
    failover: bool,
}

fn is_on(atom: &str) -> bool {
    atom.eq_ignore_ascii_case("yes") || atom.eq_ignore_ascii_case("on") || atom.eq_ignore_ascii_case("true")
}

fn positive_secs(atom: &str) -> Option<Duration> {
    atom.parse::<f64>()
        .ok()
        .filter(|v| *v > 0.0)
        .map(Duration::from_secs_f64)
}

impl DescriptorNode {
    /// Build the navigable tree out of parsed descriptor text
    pub fn from_pair(pair: &NvPair) -> Result<Self> {
        match pair.name.to_uppercase().as_str() {
            "ADDRESS" => Ok(Self::Address(Address::from_pair(pair)?)),
            "ADDRESS_LIST" => Ok(Self::AddressList(AddressList::from_pair(pair)?)),
            "DESCRIPTION" => Ok(Self::Description(Description::from_pair(pair)?)),
            "DESCRIPTION_LIST" => Ok(Self::DescriptionList(DescriptionList::from_pair(pair)?)),
            _ => Err(Error::MalformedDescriptor),
        }
    }

    fn navigate<'a>(
        &'a self,
        cx: &'a mut NavContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
        Box::pin(async move {
            match self {
                Self::Address(a) => a.navigate(cx).await,
                Self::AddressList(al) => al.navigate(cx).await,
                Self::Description(d) => d.navigate(cx).await,
                Self::DescriptionList(dl) => dl.navigate(cx).await,
            }
        })
    }

    /// Number of leaf addresses reachable through this node
    fn leaf_count(&self) -> usize {
        match self {
            Self::Address(_) => 1,
            Self::AddressList(al) => {
                if al.source_route {
                    al.children.first().map_or(0, |c| c.leaf_count())
                } else {
                    al.children.iter().map(|c| c.leaf_count()).sum()
                }
            }
            Self::Description(d) => d.children.iter().map(|c| c.leaf_count()).sum(),
            Self::DescriptionList(dl) => dl
                .children
                .iter()
                .map(|d| d.children.iter().map(|c| c.leaf_count()).sum::<usize>())
                .sum(),
        }
    }

    fn address_string(&self) -> String {
        match self {
            Self::Address(a) => a.text.clone(),
            Self::AddressList(al) => al.to_fragment(),
            // only addresses and address lists appear under source routes
            Self::Description(_) | Self::DescriptionList(_) => String::new(),
        }
    }
}

/// Accumulates state while walking one descriptor tree
pub struct NavContext<'r> {
    sbuf: Vec<String>,
    descriptions: Vec<ConnectionDescription>,
    current: Option<ConnectionDescription>,
    rng: &'r mut dyn RngCore,
}

impl<'r> NavContext<'r> {
    pub fn new(rng: &'r mut dyn RngCore) -> Self {
        Self {
            sbuf: Vec::new(),
            descriptions: Vec::new(),
            current: None,
            rng,
        }
    }

    fn open_description(&mut self) -> &mut ConnectionDescription {
        self.current = Some(ConnectionDescription::default());
        self.current.as_mut().unwrap()
    }

    fn close_description(&mut self) {
        if let Some(desc) = self.current.take() {
            self.descriptions.push(desc);
        }
    }
}

/// Walk `root` and return its connection descriptions in attempt order.
///
/// A fresh random draw happens on every call, so alternating navigations of
/// the same load-balanced descriptor yield differing orders. The source of
/// randomness is injected to keep that reproducible under test.
pub async fn navigate(
    root: &NvPair,
    rng: &mut dyn RngCore,
) -> Result<Vec<ConnectionDescription>> {
    let node = DescriptorNode::from_pair(root)?;
    let mut cx = NavContext::new(rng);
    node.navigate(&mut cx).await?;
    cx.close_description();
    if cx.descriptions.iter().all(|d| d.options.is_empty()) {
        return Err(Error::MalformedDescriptor);
    }
    debug!(
        descriptions = cx.descriptions.len(),
        options = cx.descriptions.iter().map(|d| d.options.len()).sum::<usize>(),
        "descriptor navigation complete"
    );
    Ok(cx.descriptions)
}

/// Child visit order for one node, drawn fresh per navigation
pub(crate) fn active_order(
    len: usize,
    failover: bool,
    load_balance: bool,
    rng: &mut dyn RngCore,
) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    match (failover, load_balance) {
        (true, true) => {
            let mut order: Vec<usize> = (0..len).collect();
            order.shuffle(rng);
            order
        }
        (true, false) => (0..len).collect(),
        (false, true) => vec![rng.random_range(0..len)],
        (false, false) => vec![0],
    }
}

impl Address {
    fn from_pair(pair: &NvPair) -> Result<Self> {
        if !pair.name.eq_ignore_ascii_case("ADDRESS") {
            return Err(Error::MalformedDescriptor);
        }
        let find = |name: &str| {
            pair.find_recurse(name)
                .and_then(|p| p.atom())
                .map(str::to_string)
        };
        let host = find("host").unwrap_or_else(|| "localhost".to_string());
        let port = find("port")
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(1521);
        Ok(Self {
            protocol: find("protocol").unwrap_or_else(|| "tcp".to_string()),
            host,
            port,
            https_proxy: find("https_proxy"),
            https_proxy_port: find("https_proxy_port").and_then(|p| p.parse().ok()),
            text: pair.to_string(),
        })
    }

    async fn navigate(&self, cx: &mut NavContext<'_>) -> Result<()> {
        // redirect payloads may arrive as a bare ADDRESS
        let opened_here = cx.current.is_none();
        if opened_here {
            cx.open_description();
        }

        let prefix = cx.sbuf.concat();
        let mut push = |cx: &mut NavContext<'_>, ip: Option<IpAddr>| {
            let option = ConnectOption {
                protocol: self.protocol.clone(),
                hostname: self.host.clone(),
                ip,
                port: self.port,
                https_proxy: self.https_proxy.clone(),
                https_proxy_port: self.https_proxy_port,
                cn_data: vec![prefix.clone(), self.text.clone()],
                address_text: self.text.clone(),
                done: false,
            };
            cx.current
                .as_mut()
                .expect("description open during address navigation")
                .options
                .push(option);
        };

        if let Ok(ip) = self.host.parse::<IpAddr>() {
            push(cx, Some(ip));
        } else {
            match tokio::net::lookup_host((self.host.as_str(), self.port)).await {
                Ok(addrs) => {
                    let mut seen = Vec::new();
                    for addr in addrs {
                        if seen.contains(&addr.ip()) {
                            continue;
                        }
                        seen.push(addr.ip());
                        push(cx, Some(addr.ip()));
                    }
                    if seen.is_empty() {
                        push(cx, None);
                    }
                }
                Err(err) => {
                    // unresolved hosts stay in the rotation so a later
                    // connect attempt reports the failure in context
                    debug!(host = %self.host, %err, "name resolution failed");
                    push(cx, None);
                }
            }
        }

        if opened_here {
            cx.close_description();
        }
        Ok(())
    }

    /// Append this address's text to every pending option; used when a
    /// source route turns remaining siblings into hops of one shared path
    fn add_to_string(&self, cx: &mut NavContext<'_>) {
        append_to_pending(cx, &self.text);
    }
}

fn append_to_pending(cx: &mut NavContext<'_>, fragment: &str) {
    if let Some(desc) = cx.current.as_mut() {
        for option in desc.options.iter_mut().filter(|o| !o.done) {
            option.cn_data.push(fragment.to_string());
        }
    }
}

impl AddressList {
    fn from_pair(pair: &NvPair) -> Result<Self> {
        let mut list = Self {
            children: Vec::new(),
            source_route: false,
            load_balance: false,
            failover: true,
        };
        if pair.children().is_empty() {
            return Err(Error::MalformedDescriptor);
        }
        for child in pair.children() {
            match child.name.to_uppercase().as_str() {
                "SOURCE_ROUTE" => list.source_route = child.atom().is_some_and(is_on),
                "LOAD_BALANCE" => list.load_balance = child.atom().is_some_and(is_on),
                "FAILOVER" => list.failover = child.atom().is_some_and(is_on),
                "ADDRESS" => list
                    .children
                    .push(DescriptorNode::Address(Address::from_pair(child)?)),
                "ADDRESS_LIST" => list
                    .children
                    .push(DescriptorNode::AddressList(AddressList::from_pair(child)?)),
                _ => return Err(Error::MalformedDescriptor),
            }
        }
        if list.children.is_empty() {
            return Err(Error::MalformedDescriptor);
        }
        Ok(list)
    }

    async fn navigate(&self, cx: &mut NavContext<'_>) -> Result<()> {
        let saved_len = cx.sbuf.len();
        cx.sbuf.push("(ADDRESS_LIST=".to_string());
        let active: Vec<usize>;
        if self.source_route {
            active = (0..self.children.len()).collect();
            self.children[0].navigate(cx).await?;
            for child in &self.children[1..] {
                append_to_pending(cx, &child.address_string());
            }
        } else {
            active = active_order(self.children.len(), self.failover, self.load_balance, cx.rng);
            for &i in &active {
                self.children[i].navigate(cx).await?;
            }
        }
        self.close_pending(cx, &active);
        cx.sbuf.truncate(saved_len);
        Ok(())
    }

    /// Close the `(ADDRESS_LIST=` fragment on every option this list
    /// produced. Options are walked from the newest back, stopping once
    /// more distinct endpoints have been seen than this list contributed.
    fn close_pending(&self, cx: &mut NavContext<'_>, active: &[usize]) {
        let own_leaves: usize = if self.source_route {
            self.children.first().map_or(0, |c| c.leaf_count())
        } else {
            active.iter().map(|&i| self.children[i].leaf_count()).sum()
        };
        let Some(desc) = cx.current.as_mut() else {
            return;
        };
        let mut endpoints = 0;
        let mut prev: Option<(String, u16)> = None;
        for option in desc.options.iter_mut().rev() {
            if option.done {
                break;
            }
            let key = (option.hostname.clone(), option.port);
            if prev.as_ref() != Some(&key) {
                endpoints += 1;
            }
            prev = Some(key);
            if endpoints > own_leaves {
                break;
            }
            if self.source_route {
                option.cn_data.push(SOURCE_ROUTE_FRAGMENT.to_string());
                option.cn_data.push(HOP_COUNT_FRAGMENT.to_string());
                option.done = true;
            }
            option.cn_data.push(")".to_string());
        }
    }

    /// String form used when this entire list is a hop of a source route
    fn to_fragment(&self) -> String {
        let mut s = String::from("(ADDRESS_LIST=");
        for child in &self.children {
            s.push_str(&child.address_string());
        }
        if self.source_route {
            s.push_str(SOURCE_ROUTE_FRAGMENT);
            s.push_str(HOP_COUNT_FRAGMENT);
        }
        if self.load_balance {
            s.push_str("(LOAD_BALANCE=yes)");
        }
        if !self.failover {
            s.push_str("(FAILOVER=false)");
        }
        s.push(')');
        s
    }
}

impl Description {
    fn from_pair(pair: &NvPair) -> Result<Self> {
        let mut desc = Self {
            children: Vec::new(),
            source_route: false,
            load_balance: false,
            failover: true,
            retry_count: None,
            retry_delay: None,
            connect_data: None,
            params: DescriptionParams::default(),
        };
        if pair.children().is_empty() {
            return Err(Error::MalformedDescriptor);
        }
        for child in pair.children() {
            let atom = child.atom().unwrap_or("");
            match child.name.to_uppercase().as_str() {
                "SOURCE_ROUTE" => desc.source_route = is_on(atom),
                "LOAD_BALANCE" => desc.load_balance = is_on(atom),
                "FAILOVER" => desc.failover = is_on(atom),
                "ADDRESS" => desc
                    .children
                    .push(DescriptorNode::Address(Address::from_pair(child)?)),
                "ADDRESS_LIST" => desc
                    .children
                    .push(DescriptorNode::AddressList(AddressList::from_pair(child)?)),
                "CONNECT_DATA" => {
                    let mut cdata = child.clone();
                    if let Some(pos) = cdata
                        .children()
                        .iter()
                        .position(|p| p.name.eq_ignore_ascii_case("CONNECTION_ID_PREFIX"))
                    {
                        desc.params.connection_id_prefix = cdata.children()[pos]
                            .atom()
                            .map(str::to_string);
                        cdata.remove_child(pos);
                    }
                    desc.connect_data = Some(cdata.value_to_string());
                }
                "RETRY_COUNT" => desc.retry_count = atom.parse().ok(),
                "RETRY_DELAY" => desc.retry_delay = positive_secs(atom),
                "CONNECTION_ID_PREFIX" => {
                    desc.params.connection_id_prefix = Some(atom.to_string());
                }
                "CONNECT_TIMEOUT" => desc.params.connect_timeout = positive_secs(atom),
                "TRANSPORT_CONNECT_TIMEOUT" => {
                    desc.params.transport_connect_timeout = positive_secs(atom);
                }
                "RECV_TIMEOUT" => desc.params.recv_timeout = positive_secs(atom),
                "SDU" => desc.params.sdu = atom.parse().ok(),
                "EXPIRE_TIME" => {
                    desc.params.expire_time = atom.parse().ok().filter(|v| *v > 0);
                }
                "ENABLE" => desc.params.enable = Some(atom.to_string()),
                "SECURITY" => {
                    for sec in child.children() {
                        match sec.name.to_uppercase().as_str() {
                            "SSL_SERVER_CERT_DN" => {
                                desc.params.ssl_server_cert_dn = Some(sec.value_to_string());
                            }
                            "SSL_SERVER_DN_MATCH" => {
                                desc.params.ssl_server_dn_match =
                                    sec.atom().map(is_on);
                            }
                            "WALLET_LOCATION" | "MY_WALLET_DIRECTORY" => {
                                desc.params.wallet_location =
                                    sec.atom().map(str::to_string);
                            }
                            _ => {}
                        }
                    }
                }
                // unknown description parameters are carried by other
                // drivers but have no effect here
                _ => {}
            }
        }
        Ok(desc)
    }

    async fn navigate(&self, cx: &mut NavContext<'_>) -> Result<()> {
        cx.sbuf.clear();
        cx.sbuf.push("(DESCRIPTION=".to_string());
        {
            let desc = cx.open_description();
            desc.retry_count = self.retry_count;
            desc.retry_delay = self.retry_delay;
            desc.params = self.params.clone();
        }
        self.push_param_fragments(cx);

        if self.source_route {
            if let Some((first, rest)) = self.children.split_first() {
                first.navigate(cx).await?;
                for child in rest {
                    append_to_pending(cx, &child.address_string());
                }
            }
        } else {
            let active =
                active_order(self.children.len(), self.failover, self.load_balance, cx.rng);
            for &i in &active {
                self.children[i].navigate(cx).await?;
            }
        }
        self.close_pending(cx);
        cx.close_description();
        Ok(())
    }

    /// Re-emit the description-level parameters so redirect replays carry
    /// them too
    fn push_param_fragments(&self, cx: &mut NavContext<'_>) {
        let p = &self.params;
        let mut push = |s: String| cx.sbuf.push(s);
        if let Some(t) = p.connect_timeout {
            push(format!("(CONNECT_TIMEOUT={})", t.as_secs()));
        }
        if let Some(t) = p.transport_connect_timeout {
            push(format!("(TRANSPORT_CONNECT_TIMEOUT={})", t.as_secs()));
        }
        if let Some(t) = p.recv_timeout {
            push(format!("(RECV_TIMEOUT={})", t.as_secs()));
        }
        if let Some(sdu) = p.sdu {
            push(format!("(SDU={sdu})"));
        }
        if let Some(expire) = p.expire_time {
            push(format!("(EXPIRE_TIME={expire})"));
        }
        if let Some(enable) = &p.enable {
            push(format!("(ENABLE={enable})"));
        }
        if p.ssl_server_cert_dn.is_some()
            || p.ssl_server_dn_match.is_some()
            || p.wallet_location.is_some()
        {
            let mut sec = String::from("(SECURITY=");
            if let Some(dn) = &p.ssl_server_cert_dn {
                sec.push_str(&format!("(SSL_SERVER_CERT_DN={dn})"));
            }
            if let Some(m) = p.ssl_server_dn_match {
                sec.push_str(&format!("(SSL_SERVER_DN_MATCH={m})"));
            }
            if let Some(w) = &p.wallet_location {
                sec.push_str(&format!("(WALLET_LOCATION={w})"));
            }
            sec.push(')');
            push(sec);
        }
        if !self.failover {
            push("(FAILOVER=false)".to_string());
        }
    }

    fn close_pending(&self, cx: &mut NavContext<'_>) {
        let connect_data = self.connect_data.as_deref().unwrap_or("(SERVICE_NAME=)");
        let cid = client_info_fragment();
        let Some(desc) = cx.current.as_mut() else {
            return;
        };
        for option in &mut desc.options {
            if self.source_route {
                option.cn_data.push(SOURCE_ROUTE_FRAGMENT.to_string());
            }
            option.cn_data.push(CONNECT_DATA_OPEN.to_string());
            option.cn_data.push(connect_data.to_string());
            option.cn_data.push(cid.clone());
            option.cn_data.push(")".to_string());
            option.cn_data.push(")".to_string());
            option.done = true;
        }
    }
}

impl DescriptionList {
    fn from_pair(pair: &NvPair) -> Result<Self> {
        let mut list = Self {
            children: Vec::new(),
            load_balance: true,
            failover: true,
        };
        if pair.children().is_empty() {
            return Err(Error::MalformedDescriptor);
        }
        for child in pair.children() {
            let atom = child.atom().unwrap_or("");
            match child.name.to_uppercase().as_str() {
                "LOAD_BALANCE" => list.load_balance = is_on(atom),
                "FAILOVER" => list.failover = is_on(atom),
                "SOURCE_ROUTE" => {}
                "DESCRIPTION" => list.children.push(Description::from_pair(child)?),
                _ => return Err(Error::MalformedDescriptor),
            }
        }
        if list.children.is_empty() {
            return Err(Error::MalformedDescriptor);
        }
        Ok(list)
    }

    async fn navigate(&self, cx: &mut NavContext<'_>) -> Result<()> {
        let active = active_order(self.children.len(), self.failover, self.load_balance, cx.rng);
        for &i in &active {
            Box::pin(self.children[i].navigate(cx)).await?;
        }
        Ok(())
    }
}

/// The `(CID=...)` block identifying this client inside CONNECT_DATA
fn client_info_fragment() -> String {
    let program = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("(CID=(PROGRAM={program})(HOST={host})(USER={user}))")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor;
    use rand::SeedableRng;
    use rand_pcg::Pcg32;

    fn rng() -> Pcg32 {
        Pcg32::seed_from_u64(7)
    }

    #[test]
    fn order_failover_only_keeps_source_order() {
        let mut r = rng();
        assert_eq!(active_order(4, true, false, &mut r), vec![0, 1, 2, 3]);
    }

    #[test]
    fn order_failover_load_balance_permutes() {
        let mut r = rng();
        let order = active_order(6, true, true, &mut r);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn order_load_balance_only_picks_one() {
        let mut r = rng();
        let order = active_order(5, false, true, &mut r);
        assert_eq!(order.len(), 1);
        assert!(order[0] < 5);
    }

    #[test]
    fn order_neither_picks_first() {
        let mut r = rng();
        assert_eq!(active_order(5, false, false, &mut r), vec![0]);
    }

    #[test]
    fn fresh_draw_per_call() {
        let mut r = rng();
        let orders: Vec<_> = (0..8).map(|_| active_order(6, true, true, &mut r)).collect();
        assert!(orders.windows(2).any(|w| w[0] != w[1]));
    }

    #[tokio::test]
    async fn single_address_yields_one_option() {
        let root = descriptor::parse(
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=tcp)(HOST=10.0.0.1)(PORT=1522))(CONNECT_DATA=(SERVICE_NAME=orcl)))",
        )
        .unwrap();
        let mut r = rng();
        let descs = navigate(&root, &mut r).await.unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].options.len(), 1);
        let opt = &descs[0].options[0];
        assert_eq!(opt.hostname, "10.0.0.1");
        assert_eq!(opt.ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(opt.port, 1522);
        assert_eq!(opt.protocol, "tcp");
        let data = opt.connect_data();
        assert!(data.starts_with("(DESCRIPTION=(ADDRESS=(PROTOCOL=tcp)(HOST=10.0.0.1)(PORT=1522))"));
        assert!(data.contains("(CONNECT_DATA=(SERVICE_NAME=orcl)(CID=(PROGRAM="));
        let open = data.matches('(').count();
        let close = data.matches(')').count();
        assert_eq!(open, close);
    }

    #[tokio::test]
    async fn address_list_produces_all_options_under_failover() {
        let root = descriptor::parse(
            "(DESCRIPTION=(ADDRESS_LIST=(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(ADDRESS=(HOST=10.0.0.2)(PORT=1521)))(CONNECT_DATA=(SERVICE_NAME=svc)))",
        )
        .unwrap();
        let mut r = rng();
        let descs = navigate(&root, &mut r).await.unwrap();
        let hosts: Vec<_> = descs[0].options.iter().map(|o| o.hostname.clone()).collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);
        for opt in &descs[0].options {
            let data = opt.connect_data();
            assert!(data.contains("(ADDRESS_LIST="));
            assert_eq!(data.matches('(').count(), data.matches(')').count());
        }
    }

    #[tokio::test]
    async fn no_failover_no_balance_takes_first_only() {
        let root = descriptor::parse(
            "(DESCRIPTION=(FAILOVER=off)(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(ADDRESS=(HOST=10.0.0.2)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=svc)))",
        )
        .unwrap();
        let mut r = rng();
        let descs = navigate(&root, &mut r).await.unwrap();
        assert_eq!(descs[0].options.len(), 1);
        assert_eq!(descs[0].options[0].hostname, "10.0.0.1");
    }

    #[tokio::test]
    async fn source_route_chains_hops_into_one_option() {
        let root = descriptor::parse(
            "(DESCRIPTION=(SOURCE_ROUTE=yes)(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(ADDRESS=(HOST=10.0.0.2)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=svc)))",
        )
        .unwrap();
        let mut r = rng();
        let descs = navigate(&root, &mut r).await.unwrap();
        // one shared path, not alternatives
        assert_eq!(descs[0].options.len(), 1);
        let data = descs[0].options[0].connect_data();
        assert!(data.contains("(HOST=10.0.0.1)"));
        assert!(data.contains("(HOST=10.0.0.2)"));
        assert!(data.contains("(SOURCE_ROUTE=yes)"));
    }

    #[tokio::test]
    async fn description_list_yields_description_per_child() {
        let root = descriptor::parse(
            "(DESCRIPTION_LIST=(LOAD_BALANCE=off)(DESCRIPTION=(RETRY_COUNT=2)(RETRY_DELAY=1)(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=a)))(DESCRIPTION=(ADDRESS=(HOST=10.0.0.2)(PORT=1522))(CONNECT_DATA=(SERVICE_NAME=b))))",
        )
        .unwrap();
        let mut r = rng();
        let descs = navigate(&root, &mut r).await.unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].retry_count, Some(2));
        assert_eq!(descs[0].retry_delay, Some(Duration::from_secs(1)));
        assert_eq!(descs[0].options[0].hostname, "10.0.0.1");
        assert_eq!(descs[1].options[0].hostname, "10.0.0.2");
    }

    #[tokio::test]
    async fn description_params_are_hoisted() {
        let root = descriptor::parse(
            "(DESCRIPTION=(SDU=16384)(EXPIRE_TIME=2)(CONNECT_TIMEOUT=10)(TRANSPORT_CONNECT_TIMEOUT=5)(SECURITY=(SSL_SERVER_DN_MATCH=yes)(WALLET_LOCATION=/wallet))(ADDRESS=(PROTOCOL=tcps)(HOST=10.0.0.1)(PORT=2484))(CONNECT_DATA=(SERVICE_NAME=svc)))",
        )
        .unwrap();
        let mut r = rng();
        let descs = navigate(&root, &mut r).await.unwrap();
        let params = &descs[0].params;
        assert_eq!(params.sdu, Some(16384));
        assert_eq!(params.expire_time, Some(2));
        assert_eq!(params.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(params.transport_connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(params.ssl_server_dn_match, Some(true));
        assert_eq!(params.wallet_location.as_deref(), Some("/wallet"));
    }

    #[tokio::test]
    async fn connection_id_prefix_is_extracted_from_connect_data() {
        let root = descriptor::parse(
            "(DESCRIPTION=(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=svc)(CONNECTION_ID_PREFIX=app1)))",
        )
        .unwrap();
        let mut r = rng();
        let descs = navigate(&root, &mut r).await.unwrap();
        assert_eq!(descs[0].params.connection_id_prefix.as_deref(), Some("app1"));
        // the prefix itself must not be replayed to the server
        assert!(!descs[0].options[0].connect_data().contains("CONNECTION_ID_PREFIX"));
    }

    #[tokio::test]
    async fn rejects_unknown_top_level_node() {
        let root = descriptor::parse("(BOGUS=(ADDRESS=(HOST=h)))").unwrap();
        let mut r = rng();
        assert!(matches!(
            navigate(&root, &mut r).await,
            Err(Error::MalformedDescriptor)
        ));
    }
}
