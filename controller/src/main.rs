mod entities;
mod host;
mod instance;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
