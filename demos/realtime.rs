use kiwoom::exchanges::kiwoom::Market;
use kiwoom::{KiwoomConfig, KiwoomSession};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Set KIWOOM_APPKEY and KIWOOM_SECRETKEY; KIWOOM_MOCK=true targets the mock host
    let config = match KiwoomConfig::from_env_file("KIWOOM") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            eprintln!("Please set KIWOOM_APPKEY and KIWOOM_SECRETKEY environment variables");
            return Ok(());
        }
    };

    let session = KiwoomSession::builder(config).with_rate_limit(4).connect().await?;
    println!("Session is {}", session.state());

    let codes = session
        .stock_codes(Market::Kospi, false)
        .await?
        .into_iter()
        .take(100)
        .collect::<Vec<_>>();
    println!("Watching {} KOSPI instruments", codes.len());

    session.register_tick("1", &codes, |tick| {
        println!("{} {} {} x {}", tick.time, tick.item, tick.price, tick.volume);
        Ok(())
    })?;
    session.register_order_book("2", &codes[..codes.len().min(5)], |book| {
        if let (Some(ask), Some(bid)) = (book.best_ask(), book.best_bid()) {
            println!("{} {} / {}", book.item, bid.price, ask.price);
        }
        Ok(())
    })?;

    let mut states = session.state_changes();
    let watch_for = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(watch_for);
    loop {
        tokio::select! {
            () = &mut watch_for => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("State: {}", *states.borrow_and_update());
                if let Some(error) = session.fatal_error() {
                    eprintln!("Session stopped: {}", error);
                    break;
                }
            }
        }
    }

    session.close().await;
    Ok(())
}
