//! Example that runs on Linux using a serial-USB-adapter.
//!
//! Without an upload target the modem is provisioned (joined and address queried). With a target the
//! given JPEG is posted to `http://<host>:<port>/upload` and the recognition results are printed.
use std::{env, fs, process, thread};

use esp_at_link::{
    clock::{StdDelay, SysTimer, SYS_TIMER_HZ},
    transport::{PortConfig, SerialTransport},
    upload::UploadJob,
    wifi::{Adapter, Credentials, Endpoint},
};

type LinuxAdapter = Adapter<SerialTransport, SysTimer, StdDelay, SYS_TIMER_HZ>;

/// Optional upload target parsed from the command line
struct UploadTarget {
    endpoint: Endpoint,
    image: Vec<u8>,
}

fn main() {
    env_logger::init();

    // Parse args
    let args: Vec<String> = env::args().collect();
    if args.len() != 5 && args.len() != 8 {
        println!("Usage: {} <path-to-serial> <baudrate> <ssid> <psk> [<host> <port> <image.jpg>]", args[0]);
        println!("Example: {} /dev/ttyUSB0 115200 mywifi hellopasswd123", args[0]);
        println!("Example: {} /dev/ttyUSB0 115200 mywifi hellopasswd123 10.0.0.1 8080 cat.jpg", args[0]);
        println!("\nNote: To run the example with debug logging, run it like this:");
        println!("\n  RUST_LOG=debug cargo run --example linux -- /dev/ttyUSB0 115200 mywifi hellopasswd123");
        process::exit(1);
    }
    let dev = &args[1];
    let baud_rate: u32 = args[2].parse().unwrap_or_else(|_| fail(&format!("invalid baud rate {}", args[2])));
    let credentials = Credentials::new(&args[3], &args[4]).unwrap_or_else(|e| fail(&e.to_string()));

    let target = if args.len() == 8 {
        let port: u16 = args[6].parse().unwrap_or_else(|_| fail(&format!("invalid port {}", args[6])));
        let image = fs::read(&args[7]).unwrap_or_else(|e| fail(&format!("unable to read {}: {}", args[7], e)));
        Some(UploadTarget {
            endpoint: Endpoint::new(args[5].as_str(), port),
            image,
        })
    } else {
        None
    };

    println!("Starting (dev={}, baud={:?})...", dev, baud_rate);
    let transport = SerialTransport::open(PortConfig::new(dev).baud_rate(baud_rate)).unwrap_or_else(|e| fail(&e.to_string()));

    let adapter: LinuxAdapter = Adapter::new(transport, SysTimer::new(), StdDelay);

    // Modem I/O blocks for seconds, so it runs off the main thread
    let worker = thread::Builder::new()
        .name("modem".to_string())
        .spawn(move || run(adapter, credentials, target))
        .unwrap_or_else(|e| fail(&format!("unable to spawn worker: {}", e)));

    match worker.join() {
        Ok(Ok(())) => {}
        Ok(Err(message)) => fail(&message),
        Err(_) => fail("worker thread panicked"),
    }
}

fn run(mut adapter: LinuxAdapter, credentials: Credentials, target: Option<UploadTarget>) -> Result<(), String> {
    let target = match target {
        None => {
            println!("Join WiFi \"{}\"...", credentials.ssid());
            let report = adapter.provision(&credentials).map_err(|e| e.to_string())?;
            println!("Modem ready at {} baud", report.baud_rate);
            if let Some(ssid) = report.joined_network.and_then(|network| network.ssid) {
                println!("Already joined to \"{}\"", ssid);
            }
            match report.address.and_then(|address| address.ipv4) {
                Some(ip) => println!("Local IPv4: {}", ip),
                None => println!("Local IPv4 unknown"),
            }
            return Ok(());
        }
        Some(target) => target,
    };

    println!(
        "Uploading {} bytes to {}:{}...",
        target.image.len(),
        target.endpoint.host(),
        target.endpoint.port()
    );
    let job = UploadJob::new(target.image, target.endpoint);
    let report = adapter.upload(&credentials, &job).map_err(|e| e.to_string())?;

    println!("Sent {} bytes, server answered {:?}", report.bytes_sent, report.status);
    println!("Response: {}", report.json);
    for result in &report.results {
        println!("  {:<20} {:>6.2}%", result.label, result.confidence * 100.0);
    }

    // Leave the modem in command mode for the next run
    adapter.reset_link().map_err(|e| e.to_string())?;
    Ok(())
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}
