//! Runs a program that asks for a name and answers it.
//!
//! Start a server with `ebserver`, then run `cargo run --example interactive`.

use execbox::{ClientOptions, ExecutionClient, ServerMessageKind};

const CODE: &str = r#"name = input("What is your name? ")
print(f"Hello, {name}!")
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (client, mut messages) =
        ExecutionClient::connect("ws://127.0.0.1:3000/ws/execute", ClientOptions::default());
    client.wait_connected().await;

    let execution_id = client.execute("python", CODE)?;
    println!("execution {}", execution_id);

    let mut answered = false;
    while let Some(message) = messages.recv().await {
        match message.kind {
            ServerMessageKind::Output => print!("{}", message.data.unwrap_or_default()),
            ServerMessageKind::Error => eprint!(
                "{}",
                message.data.or(message.error).unwrap_or_default()
            ),
            ServerMessageKind::InputRequired if !answered => {
                client.send_input("execbox")?;
                answered = true;
            }
            ServerMessageKind::Exit => {
                println!("\nexit code {}", message.exit_code.unwrap_or(-1));
                break;
            }
            _ => {}
        }
    }

    client.close();
    Ok(())
}
