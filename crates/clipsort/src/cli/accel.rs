//! The `clipsort accel` command.

use clipsort_core::{Analyzer, Config};

/// Check every execution provider and print the result as JSON.
pub async fn execute(config: Config) -> anyhow::Result<()> {
    let analyzer = Analyzer::new(config);
    let caps = analyzer.get_clip_accel_capabilities().await?;

    for cap in &caps.providers {
        tracing::debug!(
            provider = %cap.provider,
            supported = cap.supported,
            available = cap.available,
            enabled = cap.enabled,
            "Provider checked"
        );
    }
    println!("{}", serde_json::to_string_pretty(&caps)?);
    Ok(())
}
