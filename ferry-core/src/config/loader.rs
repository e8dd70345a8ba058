use crate::config::model::Config;

/// 配置文件路径解析顺序：FERRY_CONFIG环境变量 > ./config.toml > /etc/ferry/config.toml
pub fn get_config_path() -> String {
    if let Ok(path) = std::env::var("FERRY_CONFIG") {
        return path;
    }

    if std::path::Path::new("config.toml").exists() {
        return "config.toml".to_string();
    }

    "/etc/ferry/config.toml".to_string()
}

pub fn load_config() -> Result<Config, anyhow::Error> {
    load_config_from_path(&get_config_path())
}

pub fn load_config_from_path(config_path: &str) -> Result<Config, anyhow::Error> {
    let config_str = std::fs::read_to_string(config_path)?;
    let config: Config = toml::from_str(&config_str)?;
    config.validate()?;
    Ok(config)
}
