#[tokio::main]
async fn main() -> control_plane::Result<()> {
    control_plane::init_tracing();
    control_plane::run().await
}
