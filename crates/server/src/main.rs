#[tokio::main]
async fn main() -> miette::Result<()> {
    pacmirror_server::run().await
}
