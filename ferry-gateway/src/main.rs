//! Ferry Gateway Server
//!
//! Main entry point for the Ferry routing decision service

use ferry_gateway::start_server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app_state = start_server().await?;

    // 保持主线程运行直到收到中断信号
    tokio::signal::ctrl_c().await?;

    app_state.shutdown().await;
    Ok(())
}
