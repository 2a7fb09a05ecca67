use pagewatch_core::{Config, Paths};

/// Print the effective configuration (file, then environment) with secrets hidden.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::resolve(&paths)?;

    println!();
    println!("Configuration");
    println!("  File: {}", paths.config_file().display());
    println!();
    println!("{}", render(&config)?);
    Ok(())
}

fn render(config: &Config) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&config.redacted())?)
}
