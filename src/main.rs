use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    neural_cli::run().await
}
