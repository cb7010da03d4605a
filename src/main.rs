use tracing::{error, info, warn};

use workspace_bridge::{BridgeConfig, BridgeServer, WorkspaceIdentity};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workspace_bridge=info".into()),
        )
        .init();

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!("{error}");
            std::process::exit(1);
        }
    };

    if !config.auth_enabled() && config.allow_insecure_no_auth {
        warn!("bridge auth is disabled by BRIDGE_ALLOW_INSECURE_NO_AUTH=true (local development only)");
    }
    if config.allow_query_token_auth {
        warn!(
            "query-token auth is enabled (BRIDGE_ALLOW_QUERY_TOKEN_AUTH=true); prefer Authorization headers instead"
        );
    }

    let mut identity = WorkspaceIdentity::from_roots(&config.workspace_roots);
    if let Some(name) = config.workspace_name.clone() {
        identity = identity.with_name(name);
    }

    let server = match BridgeServer::new(config, identity).with_workspace_context() {
        Ok(server) => server,
        Err(error) => {
            error!("{error}");
            std::process::exit(1);
        }
    };

    let (assignment, listener) = match server.bind() {
        Ok(bound) => bound,
        Err(error) => {
            error!("failed to bind: {error}");
            std::process::exit(1);
        }
    };

    info!(
        workspace = %assignment.workspace_id,
        name = %server.identity().name(),
        port = assignment.assigned_port,
        primary = assignment.is_primary(),
        "workspace-bridge listening"
    );

    if let Err(error) = server.serve(listener).await {
        error!("server error: {error}");
        std::process::exit(1);
    }
}
