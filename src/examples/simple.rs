//! Simple example of using proxywhirl.

use std::sync::Arc;
use std::time::Duration;

use proxywhirl::{
    FetchSource, Fetcher, ForwardRequest, HealthMonitor, MonitorConfig, ProxyPool, RotatorConfig,
    Rotator, SourceFormat, ValidationLevel, Validator, ValidatorConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Fetching proxy candidates...");

    // Free socks5 proxy lists, one `host:port` per line.
    let fetcher = Fetcher::new(vec![
        FetchSource::new(
            "dpangestuw",
            "https://cdn.jsdelivr.net/gh/dpangestuw/Free-Proxy@main/socks5_proxies.txt",
            SourceFormat::PlainText,
        ),
        FetchSource::new(
            "proxifly",
            "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/socks5/data.txt",
            SourceFormat::PlainText,
        ),
    ]);
    let candidates = fetcher.fetch_all().await;
    println!("Found {} unique candidates", candidates.len());

    // Validate candidates before letting them carry traffic.
    let validator = Arc::new(Validator::new(ValidatorConfig {
        probe_url: "https://httpbin.org/ip".to_string(),
        timeout: Duration::from_secs(5),
        concurrency: 64,
    }));
    let proxies: Vec<_> = candidates.into_iter().map(|c| c.into_proxy()).collect();
    let results = validator.validate_batch(&proxies, ValidationLevel::Standard).await;

    let pool = Arc::new(ProxyPool::new());
    for proxy in proxies {
        let passed = results
            .iter()
            .any(|r| r.proxy_id == proxy.id && r.success);
        if passed {
            let _ = pool.add(proxy);
        }
    }
    println!("Pool holds {} working proxies", pool.len());

    // Keep the pool honest in the background.
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&pool),
        Arc::clone(&validator),
        MonitorConfig {
            check_interval: Duration::from_secs(60),
            ..MonitorConfig::default()
        },
    ));
    monitor.start();

    let rotator = Rotator::new(
        Arc::clone(&pool),
        RotatorConfig::builder()
            .max_retries(2)
            .request_timeout(Duration::from_secs(10))
            // rate limit for each proxy, lower throughput but avoids bans
            .max_rps_per_proxy(3.0)
            .default_strategy("weighted")
            .build(),
    )?;

    println!("Sending request...");
    let response = rotator
        .forward(ForwardRequest::get("https://httpbin.org/ip"), None)
        .await?;

    println!("Status: {}", response.status);
    println!("Via proxy: {} ({} ms)", response.proxy_id, response.latency_ms);
    println!("Response: {}", String::from_utf8_lossy(&response.body));

    monitor.stop().await;
    Ok(())
}
