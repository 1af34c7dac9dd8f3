//! TutorLive - interactive CLI for the live tutor and mind-map tools.
//!
//! Starts a live tutoring session against the streaming endpoint and takes
//! simple line commands on stdin: mute, video toggle, mind-map expansion,
//! quit.

use anyhow::Context;
use tokio::io::AsyncBufReadExt;
use tracing::info;
use tutorlive::genai::GenAiClient;
use tutorlive::live::LiveConfig;
use tutorlive::mindmap::{MindMap, NodeId};
use tutorlive::session::{start_session, SessionConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    info!("starting tutorlive");

    let api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY is not set")?;

    let mut live_cfg = LiveConfig::from_api_key(&api_key);
    live_cfg.system_instruction = Some(
        "You are a professional, patient, and encouraging tutor. You can see what \
         the student shows you through video. Keep explanations brief and \
         interactive."
            .to_string(),
    );

    let mut session_cfg = SessionConfig::default();
    if let Ok(dir) = std::env::var("TUTORLIVE_RECORD_DIR") {
        session_cfg.record_dir = Some(dir.into());
    }

    let handle = start_session(session_cfg, live_cfg)?;

    let mut status_rx = handle.status();
    tokio::spawn(async move {
        loop {
            {
                let status = status_rx.borrow_and_update();
                match &status.error {
                    Some(e) => println!("[{:?}] {} ({})", status.phase, status.message, e),
                    None => println!("[{:?}] {}", status.phase, status.message),
                }
            }
            if status_rx.changed().await.is_err() {
                break;
            }
        }
    });

    println!("commands: m = mute/unmute, v = video on/off, e <topic> = expand a mind-map topic, q = quit");

    let genai = GenAiClient::new(api_key);
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        match line {
            "" => {}
            "m" => handle.toggle_mute(),
            "v" => handle.toggle_video(),
            "q" => break,
            _ if line.starts_with("e ") => {
                let topic = line[2..].trim();
                if !topic.is_empty() {
                    expand_and_print(&genai, topic).await;
                }
            }
            other => println!("unknown command: {}", other),
        }
    }

    handle.stop();
    handle.wait().await;
    info!("tutorlive stopped");
    Ok(())
}

async fn expand_and_print(genai: &GenAiClient, topic: &str) {
    println!("expanding \"{}\"...", topic);
    match genai.expand_node(topic, &[]).await {
        Ok(children) => {
            let mut map = MindMap::new(topic);
            map.insert_children(map.root(), &children);
            print_tree(&map, map.root(), 0);
        }
        Err(e) => println!("expansion failed: {}", e),
    }
}

fn print_tree(map: &MindMap, id: NodeId, depth: usize) {
    let Some(node) = map.get(id) else { return };
    let indent = "  ".repeat(depth);
    match &node.description {
        Some(description) => println!("{}- {}: {}", indent, node.label, description),
        None => println!("{}- {}", indent, node.label),
    }
    for &child in &node.children {
        print_tree(map, child, depth + 1);
    }
}
