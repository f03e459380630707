use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context as _, bail};
use notify::{Event, EventKind, RecursiveMode, Watcher};

use crate::{AliasKind, Config};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    let config: Config = toml::from_str(&content)?;
    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.auth.keys.is_empty() {
        bail!(indoc::indoc! {r#"
            No gateway API keys configured. Prism requires at least one key so clients can authenticate.

            Example configuration:

              [auth.keys.default]
              secret = "sk-prism-change-me"
        "#});
    }

    for (name, provider) in &config.providers {
        for dialect in &provider.dialects {
            if provider.endpoint(*dialect).is_none() {
                bail!("Provider '{name}' declares dialect '{dialect}' without an endpoint for it");
            }
        }

        if let Some(discount) = provider.discount
            && !(0.0..1.0).contains(&discount)
        {
            bail!("Provider '{name}' has discount {discount}, expected a factor in [0, 1)");
        }
    }

    let mut seen_aliases = std::collections::HashSet::new();

    for (primary, alias) in &config.aliases {
        for id in std::iter::once(primary).chain(alias.aliases.iter()) {
            if !seen_aliases.insert(id.to_ascii_lowercase()) {
                bail!("Alias id '{id}' is configured more than once");
            }
        }

        if alias.targets.is_empty() {
            bail!("Alias '{primary}' has no targets");
        }

        for target in &alias.targets {
            let Some(provider) = config.providers.get(&target.provider) else {
                bail!(
                    "Alias '{primary}' references unknown provider '{provider}'",
                    provider = target.provider
                );
            };

            if let Some(dialect) = target.api_type
                && !provider.speaks(dialect)
            {
                bail!(
                    "Alias '{primary}' target '{model}' requests dialect '{dialect}' which provider '{provider}' does not speak",
                    model = target.model,
                    provider = target.provider,
                );
            }

            if let Some(weight) = target.weight
                && weight <= 0.0
            {
                bail!(
                    "Alias '{primary}' target '{model}' has non-positive weight {weight}",
                    model = target.model,
                );
            }
        }

        if alias.kind != AliasKind::Chat {
            log::warn!(
                "Alias '{primary}' has kind '{kind:?}' which the dispatch pipeline rejects at request time",
                kind = alias.kind
            );
        }
    }

    Ok(())
}

/// Watch the configuration file and invoke the callback with each reload.
///
/// Editors and atomic writers replace the file rather than writing in place,
/// so the watcher follows the parent directory and reacts to any event that
/// touches the configured path. Reload errors are logged and the previous
/// configuration stays active.
pub fn watch<F>(path: PathBuf, on_change: F) -> anyhow::Result<notify::RecommendedWatcher>
where
    F: Fn(Config) + Send + 'static,
{
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));

    let watched = path.clone();

    let mut watcher = notify::recommended_watcher(move |event: Result<Event, notify::Error>| {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Configuration watcher error: {e}");
                return;
            }
        };

        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }

        if !event.paths.iter().any(|p| p.ends_with(watched.file_name().unwrap_or_default())) {
            return;
        }

        // Editors often fire several events per save; a short settle delay
        // avoids reading a half-written file.
        std::thread::sleep(Duration::from_millis(50));

        match load(&watched) {
            Ok(config) => {
                log::info!("Configuration reloaded from {}", watched.display());
                on_change(config);
            }
            Err(e) => {
                log::error!("Configuration reload failed, keeping previous configuration: {e}");
            }
        }
    })?;

    watcher.watch(&parent, RecursiveMode::NonRecursive)?;

    Ok(watcher)
}
