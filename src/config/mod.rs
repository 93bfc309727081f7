//! Server endpoint configuration.
//!
//! Defaults match the vendor cloud. An optional `config.toml` under the user
//! config directory overrides them, and CLI flags override the file. Nothing
//! is ever written back — recordings are the only output of an invocation.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// Vendor cloud API endpoint.
pub const DEFAULT_API_SERVER: &str = "194.195.251.29";
pub const DEFAULT_API_PORT: u16 = 8089;
pub const DEFAULT_REGISTER_PORT: u16 = 8900;
pub const DEFAULT_STREAM_PORT: u16 = 8800;
pub const DEFAULT_RTSP_PORT: u16 = 8554;

/// On-disk configuration; every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub server: Option<String>,
    pub api_port: Option<u16>,
    pub register_port: Option<u16>,
    pub stream_port: Option<u16>,
    pub rtsp_port: Option<u16>,
}

/// Resolved endpoint set for one invocation.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub server: String,
    pub api_port: u16,
    pub register_port: u16,
    pub stream_port: u16,
}

impl Config {
    fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("net", "nvdvr", "v380-cli")
            .context("could not determine config directory")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from disk; a missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Merge the file with an optional CLI server override.
    pub fn endpoints(&self, server_override: Option<&str>) -> Endpoints {
        Endpoints {
            server: server_override
                .map(str::to_owned)
                .or_else(|| self.server.clone())
                .unwrap_or_else(|| DEFAULT_API_SERVER.to_owned()),
            api_port: self.api_port.unwrap_or(DEFAULT_API_PORT),
            register_port: self.register_port.unwrap_or(DEFAULT_REGISTER_PORT),
            stream_port: self.stream_port.unwrap_or(DEFAULT_STREAM_PORT),
        }
    }

    /// RTSP port, with the CLI flag taking precedence over the file.
    pub fn rtsp_port(&self, cli_override: Option<u16>) -> u16 {
        cli_override.or(self.rtsp_port).unwrap_or(DEFAULT_RTSP_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let cfg = Config::default();
        let ep = cfg.endpoints(None);
        assert_eq!(ep.server, DEFAULT_API_SERVER);
        assert_eq!(ep.api_port, 8089);
        assert_eq!(ep.register_port, 8900);
        assert_eq!(ep.stream_port, 8800);
        assert_eq!(cfg.rtsp_port(None), 8554);
    }

    #[test]
    fn test_file_and_cli_precedence() {
        let cfg: Config =
            toml::from_str("server = \"10.0.0.2\"\nstream_port = 9800\nrtsp_port = 9554\n")
                .unwrap();

        let ep = cfg.endpoints(None);
        assert_eq!(ep.server, "10.0.0.2");
        assert_eq!(ep.stream_port, 9800);
        assert_eq!(ep.api_port, DEFAULT_API_PORT);

        let ep = cfg.endpoints(Some("10.0.0.9"));
        assert_eq!(ep.server, "10.0.0.9");

        assert_eq!(cfg.rtsp_port(None), 9554);
        assert_eq!(cfg.rtsp_port(Some(8554)), 8554);
    }
}
