//! `vmess://` share links handed to end users.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;

const SCHEME: &str = "vmess://";

/// Client-side VMess profile, fields in alphabetical order.
#[derive(Debug, Clone, Serialize)]
struct VmessProfile<'a> {
    add: &'a str,
    aid: &'a str,
    alpn: &'a str,
    fp: &'a str,
    host: &'a str,
    id: &'a str,
    net: &'a str,
    path: &'a str,
    port: String,
    ps: &'a str,
    scy: &'a str,
    sni: &'a str,
    tls: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    v: &'a str,
}

/// Plain TCP VMess link for `address:port` authenticated as `client_id`.
/// `remark` is what clients show as the profile name.
pub fn vmess_link(
    address: &str,
    port: u16,
    client_id: &str,
    remark: &str,
) -> Result<String, serde_json::Error> {
    let profile = VmessProfile {
        add: address,
        aid: "0",
        alpn: "",
        fp: "",
        host: "",
        id: client_id,
        net: "tcp",
        path: "",
        port: port.to_string(),
        ps: remark,
        scy: "auto",
        sni: "",
        tls: "",
        kind: "none",
        v: "2",
    };
    let json = serde_json::to_vec(&profile)?;
    Ok(format!("{}{}", SCHEME, STANDARD.encode(json)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(link: &str) -> serde_json::Value {
        let payload = link.strip_prefix(SCHEME).expect("vmess scheme");
        let raw = STANDARD.decode(payload).expect("base64 payload");
        serde_json::from_slice(&raw).expect("json payload")
    }

    #[test]
    fn test_vmess_link_carries_endpoint() {
        let id = "6f1c0c1e-0000-4000-8000-000000000001";
        let link = vmess_link("203.0.113.5", 10086, id, "Paris 2").unwrap();
        assert!(link.starts_with("vmess://"));

        let v = decode(&link);
        assert_eq!(v["add"], "203.0.113.5");
        assert_eq!(v["port"], "10086");
        assert_eq!(v["id"], "6f1c0c1e-0000-4000-8000-000000000001");
        assert_eq!(v["ps"], "Paris 2");
        assert_eq!(v["net"], "tcp");
        assert_eq!(v["type"], "none");
        assert_eq!(v["aid"], "0");
        assert_eq!(v["v"], "2");
    }
}
