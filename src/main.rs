// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use dotenvy::dotenv;
use log::{error, info};

use mailbridge::config::Settings;
use mailbridge::domain::UserConfig;
use mailbridge::engine::Engine;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    info!("starting mail bridge...");

    let settings = match Settings::new(None) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to load application settings: {:?}", e);
            panic!("configuration loading failed: {:?}", e);
        }
    };

    info!("remote config: host={}, port={}, user={}", settings.remote.host, settings.remote.port, settings.remote.user);

    let engine = Engine::new(&settings)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let user_cfg = UserConfig {
        user: settings.remote.user.clone(),
        remote_host: settings.remote.host.clone(),
        remote_port: settings.remote.port,
        remote_user: settings.remote.user.clone(),
        remote_pass: settings.remote.pass.clone(),
        submission_host: settings.submission.host.clone(),
        submission_port: settings.submission.port,
        use_tls: true,
        setup_complete: false,
        last_sync: None,
    };

    engine
        .register_user(&user_cfg)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    engine.spawn_idle_ping();

    info!("bridge running for user {}", user_cfg.user);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining...");
    engine.shutdown().await;

    Ok(())
}
