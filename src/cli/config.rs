use std::fs;
use std::path::PathBuf;

use crate::config::generate::generate_starter_config;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    write_config(&generate_starter_config(), stdout)
}

fn write_config(config_content: &str, stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Try ~/.config/logship/config.yml first
    let config_path = dirs::home_dir().and_then(|home_dir| {
        let user_config = home_dir.join(".config/logship/config.yml");
        let parent = user_config.parent()?;
        match fs::create_dir_all(parent) {
            Ok(_) => Some(user_config),
            Err(_) => {
                eprintln!("Warning: Could not create directory {}", parent.display());
                eprintln!("Falling back to /etc/logship/config.yml");
                None
            }
        }
    });

    let config_path = config_path.unwrap_or_else(|| PathBuf::from("/etc/logship/config.yml"));

    if config_path.exists() {
        eprintln!(
            "Error: Config file already exists at {}",
            config_path.display()
        );
        eprintln!("Remove it first or use --stdout to print the config");
        std::process::exit(1);
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    match crate::config::load_config(&path) {
        Ok(config) => {
            println!(
                "Config is valid: {} client(s), WAL at {}",
                config.clients.len(),
                config.wal.dir.display()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Config validation failed:\n{}", e);
            std::process::exit(1);
        }
    }
}
