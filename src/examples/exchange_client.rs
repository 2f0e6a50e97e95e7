use serde_json::{json, Value};
use std::net::UdpSocket;
use std::time::Duration;

fn call(sock: &UdpSocket, request: Value) -> anyhow::Result<Value> {
    sock.send(request.to_string().as_bytes())?;
    let mut buf = vec![0u8; 65536];
    let size = sock.recv(&mut buf)?;
    let reply: Value = serde_json::from_slice(&buf[..size])?;
    if let Some(err) = reply.get("error") {
        anyhow::bail!("{} failed: {}", request["method"], err);
    }
    Ok(reply)
}

fn main() -> anyhow::Result<()> {
    let addr = std::env::var("LATENT_EXCHANGE_ADDR").unwrap_or_else(|_| "127.0.0.1:50051".to_string());
    let sock = UdpSocket::bind("0.0.0.0:0")?;
    sock.connect(&addr)?;
    sock.set_read_timeout(Some(Duration::from_secs(5)))?;
    println!("Connected to latent exchange at {}", addr);

    let cap = call(&sock, json!({"method": "capability"}))?;
    println!("\n1. Capability: {}", serde_json::to_string_pretty(&cap)?);

    // Seller registers a matrix and aligns a toy hidden state.
    let created = call(
        &sock,
        json!({"method": "createMatrix", "sourceModel": "llama-3-8b", "targetModel": "mistral-7b",
               "sourceDim": 64, "targetDim": 96, "activation": "gelu"}),
    )?;
    println!("\n2. Matrix {} ({})", created["matrixId"], created["architecture"]);

    let hidden: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.37).sin()).collect();
    let aligned = call(
        &sock,
        json!({"method": "align", "vector": hidden, "target": {"matrixId": created["matrixId"]}}),
    )?;
    println!(
        "\n3. Aligned to {} dims, confidence {}, tier {}",
        aligned["alignedVector"].as_array().map_or(0, Vec::len),
        aligned["confidence"],
        aligned["qualityTier"]
    );

    // Compress a small KV-cache.
    let keys: Vec<Vec<f32>> = (0..48)
        .map(|t| (0..16).map(|d| ((t * 7 + d) as f32 * 0.11).cos()).collect())
        .collect();
    let queries = vec![keys[5].clone(), keys[30].clone()];
    let compressed = call(
        &sock,
        json!({"method": "compress", "keys": keys, "values": keys, "queries": queries, "modelName": "gpt-4"}),
    )?;
    println!("\n4. KV-cache: {}", compressed["stats"]);

    // Buyer challenges the seller.
    let challenge = call(&sock, json!({"method": "generateChallenge"}))?;
    let prompts = challenge["testPrompts"].as_array().cloned().unwrap_or_default();
    println!("\n5. Challenge {} with {} prompts:", challenge["id"], prompts.len());
    for p in &prompts {
        println!("   [{}] {}", p["category"], p["prompt"]);
    }

    let outputs: Vec<Vec<f32>> = prompts
        .iter()
        .enumerate()
        .map(|(i, _)| (0..64).map(|d| (((i * 64 + d) as f32) * 0.618).sin()).collect())
        .collect();
    let verdict = call(
        &sock,
        json!({"method": "verify", "challengeId": challenge["id"], "vectorOutputs": outputs,
               "nonce": challenge["nonce"]}),
    )?;
    println!("\n6. Verification: {}", serde_json::to_string_pretty(&verdict)?);

    Ok(())
}
