#[tokio::main]
async fn main() -> anyhow::Result<()> {
    order_desk::run().await
}
