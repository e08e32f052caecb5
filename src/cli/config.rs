use crate::cli::Role;
use crate::config::generate::{generate_server_config, generate_tailer_config};
use crate::config::parse::{load_server_config, load_tailer_config};
use std::fs;
use std::path::{Path, PathBuf};

/// Starter config text for a role.
pub fn starter_config(role: Role) -> String {
    match role {
        Role::Tailer => generate_tailer_config(),
        Role::Server => generate_server_config(),
    }
}

pub fn init(role: Role, stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = starter_config(role);

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    let config_path = default_write_path(role);
    write_config(&config_content, &config_path)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// ~/.config/logship/<role>.yml when its directory can be created,
/// otherwise /etc/logship/<role>.yml.
fn default_write_path(role: Role) -> PathBuf {
    let file_name = format!("{}.yml", role.as_str());

    if let Some(home_dir) = dirs::home_dir() {
        let dir = home_dir.join(".config/logship");
        match fs::create_dir_all(&dir) {
            Ok(()) => return dir.join(file_name),
            Err(_) => {
                eprintln!("Warning: Could not create directory {}", dir.display());
                eprintln!("Falling back to /etc/logship/{}", file_name);
            }
        }
    }

    PathBuf::from("/etc/logship").join(file_name)
}

/// Write `content` to `path`, refusing to overwrite an existing file.
pub fn write_config(content: &str, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "Config file already exists at {}. Remove it first or use --stdout to print the config",
            path.display()
        )
        .into());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

pub fn validate(role: Role, config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating {} config file: {}", role.as_str(), path.display());

    let result = match role {
        Role::Tailer => load_tailer_config(&path).map(|_| ()),
        Role::Server => load_server_config(&path).map(|_| ()),
    };

    match result {
        Ok(()) => {
            println!("✓ Config is valid");
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            std::process::exit(1);
        }
    }
}
