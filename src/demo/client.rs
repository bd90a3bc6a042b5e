extern crate resiliency_lib;

use std::env;
use std::time::Duration;

use anyhow::anyhow;
use tokio_stream::StreamExt;

use resiliency_lib::adapter::ResiliencyAdapter;
use resiliency_lib::breaker::{BreakerSettings, CircuitBreaker};
use resiliency_lib::comms::resiliency_service_client::ResiliencyServiceClient;
use resiliency_lib::comms::ResiliencyRequest;
use resiliency_lib::port::ResiliencyPort;

const OK: u32 = 0;
const UNKNOWN: u32 = 2;

#[derive(Debug)]
enum Scenario {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
    Breaker,
    Metadata,
}

fn request(min_delay: i32, max_delay: i32, status_codes: &[u32]) -> ResiliencyRequest {
    ResiliencyRequest {
        min_delay_seconds: min_delay,
        max_delay_seconds: max_delay,
        status_codes: status_codes.to_vec(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = env::args().collect();

    let scenario = if let Some(scenario_str) = args.get(1) {
        match scenario_str.as_str() {
            "unary" => Ok(Scenario::Unary),
            "server-streaming" => Ok(Scenario::ServerStreaming),
            "client-streaming" => Ok(Scenario::ClientStreaming),
            "bidirectional" => Ok(Scenario::Bidirectional),
            "breaker" => Ok(Scenario::Breaker),
            "metadata" => Ok(Scenario::Metadata),
            _ => Err(anyhow!("Unknown scenario flag \"{}\"", scenario_str)),
        }?
    } else {
        Scenario::Unary
    };

    let endpoint = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "http://localhost:9090".to_string());

    println!("Running scenario {:?} against {}", scenario, endpoint);

    // Dialed once per process; the adapter never manages the connection.
    let client = ResiliencyServiceClient::connect(endpoint).await?;
    let mut adapter = ResiliencyAdapter::new(client);

    match scenario {
        Scenario::Unary => run_unary(&mut adapter).await,
        Scenario::ServerStreaming => run_server_streaming(&mut adapter).await,
        Scenario::ClientStreaming => run_client_streaming(&mut adapter).await,
        Scenario::Bidirectional => run_bidirectional(&mut adapter).await,
        Scenario::Breaker => run_breaker(&mut adapter).await,
        Scenario::Metadata => run_metadata(&mut adapter).await,
    }

    Ok(())
}

async fn run_unary<P: ResiliencyPort>(adapter: &mut ResiliencyAdapter<P>) {
    match adapter
        .unary(request(0, 3, &[UNKNOWN, OK]), Some(Duration::from_secs(5)))
        .await
    {
        Ok(res) => println!("{}", res.payload),
        Err(err) => println!("Failed to call unary : {}", err),
    }
}

async fn run_server_streaming<P: ResiliencyPort>(adapter: &mut ResiliencyAdapter<P>) {
    let mut stream = match adapter
        .server_streaming(request(0, 3, &[OK]), Some(Duration::from_secs(15)))
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            println!("Failed to call server-streaming : {}", err);
            return;
        }
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(res) => println!("{}", res.payload),
            Err(err) => println!("Error on server-streaming : {}", err),
        }
    }
}

async fn run_client_streaming<P: ResiliencyPort>(adapter: &mut ResiliencyAdapter<P>) {
    let requests = (0..10).map(|_| request(0, 3, &[OK])).collect();

    match adapter
        .client_streaming(requests, Some(Duration::from_secs(10)))
        .await
    {
        Ok(res) => println!("{}", res.payload),
        Err(err) => println!("Failed to call client-streaming : {}", err),
    }
}

async fn run_bidirectional<P: ResiliencyPort>(adapter: &mut ResiliencyAdapter<P>) {
    let requests = (0..10).map(|_| request(0, 3, &[OK])).collect();

    let mut stream = match adapter
        .bidirectional(requests, Some(Duration::from_secs(10)))
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            println!("Failed to call bidirectional : {}", err);
            return;
        }
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(res) => println!("{}", res.payload),
            Err(err) => println!("Error on bidirectional : {}", err),
        }
    }
}

async fn run_breaker<P: ResiliencyPort>(adapter: &mut ResiliencyAdapter<P>) {
    let breaker = CircuitBreaker::new(BreakerSettings {
        name: "demo-circuit-breaker".to_string(),
        ..BreakerSettings::default()
    });

    for _ in 0..300 {
        match adapter
            .unary_with_breaker(&breaker, request(0, 0, &[UNKNOWN, OK]), None)
            .await
        {
            Ok(res) => println!("{}", res.payload),
            Err(err) if err.is_breaker_open() => {
                // Non-fatal gating; wait out the cool-down and keep going.
                println!("Call rejected : {}", err);
            }
            Err(err) => println!("Failed to call unary : {}", err),
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn run_metadata<P: ResiliencyPort>(adapter: &mut ResiliencyAdapter<P>) {
    match adapter
        .unary_with_metadata(request(0, 1, &[OK]), Some(Duration::from_secs(5)))
        .await
    {
        Ok(exchange) => {
            println!("{}", exchange.value.payload);
            if !exchange.has_metadata() {
                println!("No response metadata was present");
            }
            for (key, value) in &exchange.metadata {
                println!("  {} : {}", key, value);
            }
        }
        Err(err) => {
            println!("Failed to call unary with metadata : {}", err);
            return;
        }
    }

    let requests = (0..10).map(|_| request(0, 1, &[OK])).collect();

    match adapter
        .bidirectional_with_metadata(requests, Some(Duration::from_secs(10)))
        .await
    {
        Ok(exchange) => {
            for (key, value) in &exchange.metadata {
                println!("  {} : {}", key, value);
            }

            let mut stream = exchange.value;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(res) => println!("{}", res.payload),
                    Err(err) => println!("Error on bidirectional : {}", err),
                }
            }
        }
        Err(err) => println!("Failed to call bidirectional with metadata : {}", err),
    }
}
