use support_chat_server::app;

#[tokio::main]
async fn main() {
    app::run().await;
}
