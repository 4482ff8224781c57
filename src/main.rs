#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracerx_coordinator::server::run().await
}
