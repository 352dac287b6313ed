use std::sync::Arc;

use mesh_tunnel_lib::admission::{self, AppState};
use mesh_tunnel_lib::manager::{self, VpnManager};
use mesh_tunnel_lib::tunnel::{self, Tooling};

use crate::cli::ProviderArgs;

pub async fn run(args: ProviderArgs) -> exitcode::ExitCode {
    if let Err(e) = tunnel::available() {
        tracing::error!(error = %e, "wireguard toolchain not usable");
        return exitcode::UNAVAILABLE;
    }

    let settings = manager::Settings {
        subnet: args.ip_range,
        listen_port: args.vpn_port,
        endpoint: args.endpoint_announce,
        announce_domain: args.announce_domain,
        route_ip: args.route_ip,
        route_port: args.route_port,
        auth_api_url: args.auth_api_url,
        config_dir: args.config_dir,
    };

    let manager = match VpnManager::init(settings, Arc::new(Tooling::new())) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize vpn manager");
            return exitcode::CONFIG;
        }
    };

    let app = admission::router(Arc::new(AppState::new(manager)));
    let listener = match tokio::net::TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, listen = %args.listen, "failed to bind admission api");
            return exitcode::OSERR;
        }
    };
    tracing::info!(listen = %args.listen, "admission api listening");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed installing signal handler");
        }
        tracing::info!("initiate shutdown");
    };

    match axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        Ok(()) => exitcode::OK,
        Err(e) => {
            tracing::error!(error = %e, "admission api server failed");
            exitcode::IOERR
        }
    }
}
