//! First-boot payload turning a blank Ubuntu server into a proxy endpoint.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use uuid::Uuid;

const DAEMON_CONFIG_DIR: &str = "/usr/local/etc/v2ray";
const ACCESS_LOG: &str = "/var/log/v2ray/access.log";
const WATCHDOG_PATH: &str = "/usr/local/bin/anywhere-idle-watchdog.sh";

/// Minutes without proxy traffic after which the server powers itself off.
pub const IDLE_MINUTES: u32 = 30;

/// Powers the machine off when the access log has been quiet for
/// `IDLE_MINUTES`. Only acts during the last ten minutes of each hour.
fn watchdog_script() -> String {
    format!(
        r#"#!/bin/bash
minute=$(date +%-M)
[[ "$minute" -ge 50 ]] || exit 0
log_file="{ACCESS_LOG}"
[[ -f "$log_file" ]] || exit 0
idle=$(( ($(date +%s) - $(stat -c %Y "$log_file")) / 60 ))
if [[ "$idle" -ge {IDLE_MINUTES} ]]; then
    logger -t anywhere "proxy idle for ${{idle}}m, powering off"
    shutdown -h now
fi
"#
    )
}

/// Daemon config accepting VMess clients authenticated by `client_id` on `port`.
fn daemon_config(client_id: Uuid, port: u16) -> serde_json::Value {
    json!({
        "log": {
            "access": ACCESS_LOG,
            "error": "/var/log/v2ray/error.log",
            "loglevel": "info"
        },
        "inbounds": [{
            "port": port,
            "protocol": "vmess",
            "settings": {
                "clients": [{ "id": client_id.to_string(), "alterId": 0 }]
            }
        }],
        "outbounds": [{ "protocol": "freedom", "settings": {} }]
    })
}

/// Shell script run once by cloud-init on first boot.
pub fn render_cloud_init(client_id: Uuid, port: u16) -> String {
    let config = serde_json::to_string_pretty(&daemon_config(client_id, port)).unwrap_or_default();
    let watchdog = STANDARD.encode(watchdog_script());
    format!(
        r#"#!/bin/bash
set -u
bash <(curl -L https://github.com/v2fly/fhs-install-v2ray/raw/master/install-release.sh)
mkdir -p {DAEMON_CONFIG_DIR} /var/log/v2ray
cat > {DAEMON_CONFIG_DIR}/config.json << 'ANYWHERE_EOF'
{config}
ANYWHERE_EOF
systemctl enable v2ray
systemctl restart v2ray
echo {watchdog} | base64 -d > {WATCHDOG_PATH}
chmod +x {WATCHDOG_PATH}
DEBIAN_FRONTEND=noninteractive apt-get install -y cron
systemctl enable --now cron
(crontab -l 2>/dev/null; echo "* * * * * bash {WATCHDOG_PATH}") | crontab -
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_embeds_client_id_and_port() {
        let id = Uuid::parse_str("6f1c0c1e-0000-4000-8000-000000000001").unwrap();
        let script = render_cloud_init(id, 10086);

        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("\"id\": \"6f1c0c1e-0000-4000-8000-000000000001\""));
        assert!(script.contains("\"port\": 10086"));
        assert!(script.contains(WATCHDOG_PATH));
    }

    #[test]
    fn test_watchdog_is_base64_embedded() {
        let script = render_cloud_init(Uuid::new_v4(), 443);
        let encoded = script
            .lines()
            .find_map(|l| l.strip_prefix("echo ").and_then(|r| r.split(' ').next()))
            .unwrap();
        let decoded = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert!(decoded.contains("shutdown -h now"));
        assert!(decoded.contains(&format!("-ge {}", IDLE_MINUTES)));
    }
}
