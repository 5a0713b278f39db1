use crate::error::KvResult;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    // Persistence
    pub appendonly: bool,
    pub appendfilename: String,
    pub maxclients: usize,
    // Cluster
    pub self_id: String,
    pub peers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1".to_string(),
            port: 6399,
            appendonly: false,
            appendfilename: "appendonly.aof".to_string(),
            maxclients: 10000,
            self_id: String::new(),
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Parse `key value` lines on top of the defaults.
    pub fn parse(text: &str) -> Self {
        let mut config = Config::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(' ') {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };
            config.set(key, value);
        }
        config
    }

    pub fn from_file(path: impl AsRef<Path>) -> KvResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Config::parse(&text))
    }

    /// `--config <file>` is applied first wherever it appears; the other
    /// flags override it.
    pub fn from_args(args: &[String]) -> KvResult<Self> {
        let mut config = match args.iter().position(|a| a == "--config") {
            Some(i) if i + 1 < args.len() => Config::from_file(&args[i + 1])?,
            _ => Config::default(),
        };
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            if let Some(key) = flag.strip_prefix("--")
                && i + 1 < args.len()
            {
                if key != "config" {
                    config.set(key, &args[i + 1]);
                }
                i += 1;
            }
            i += 1;
        }
        Ok(config)
    }

    /// Apply one setting. Unknown keys are ignored; bad numbers keep the
    /// current value.
    pub fn set(&mut self, key: &str, value: &str) {
        match key.to_lowercase().as_str() {
            "bind" => self.bind = value.to_string(),
            "port" => parse_into(&mut self.port, key, value),
            "appendonly" => self.appendonly = value.eq_ignore_ascii_case("yes"),
            "appendfilename" => self.appendfilename = value.to_string(),
            "maxclients" => parse_into(&mut self.maxclients, key, value),
            "self" => self.self_id = value.to_string(),
            "peers" => {
                self.peers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect();
            }
            _ => {}
        }
    }

    pub fn cluster_enabled(&self) -> bool {
        !self.self_id.is_empty() && !self.peers.is_empty()
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_into<T: std::str::FromStr>(field: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(v) => *field = v,
        Err(_) => warn!("Invalid value for {key}: {value:?}, keeping default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.addr(), "127.0.0.1:6399");
        assert!(!config.appendonly);
        assert_eq!(config.appendfilename, "appendonly.aof");
        assert_eq!(config.maxclients, 10000);
        assert!(!config.cluster_enabled());
    }

    #[test]
    fn test_parse() {
        let text = "\
# comment line
bind 0.0.0.0
PORT 7001
appendonly yes
appendfilename data.aof
maxclients lots
self 127.0.0.1:7001
peers 127.0.0.1:7002, 127.0.0.1:7003
unknown whatever
";
        let config = Config::parse(text);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 7001);
        assert!(config.appendonly);
        assert_eq!(config.appendfilename, "data.aof");
        assert_eq!(config.maxclients, 10000);
        assert_eq!(config.self_id, "127.0.0.1:7001");
        assert_eq!(config.peers, ["127.0.0.1:7002", "127.0.0.1:7003"]);
        assert!(config.cluster_enabled());
    }

    #[test]
    fn test_from_args_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port 7001\nappendonly yes").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = Config::from_args(&args(&["--port", "7005", "--config", &path])).unwrap();
        assert_eq!(config.port, 7005);
        assert!(config.appendonly);

        let config = Config::from_args(&args(&["--appendonly", "no", "--peers", "a:1,b:2"])).unwrap();
        assert!(!config.appendonly);
        assert_eq!(config.peers, ["a:1", "b:2"]);
        assert!(!config.cluster_enabled());
    }

    #[test]
    fn test_missing_config_file() {
        assert!(Config::from_args(&args(&["--config", "/nonexistent/cairn.conf"])).is_err());
    }
}
