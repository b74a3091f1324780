use dcc_tester::CommandStationSim;
use std::io::{self, BufRead, Read, Write};
use std::time::Duration;

// The main entry point for the command-line simulator application.
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .init();

    println!("===========================");
    println!("  DCC Tester Simulator     ");
    println!("===========================");

    // Prompt for the decoder address sitting on the simulated track.
    print!("Enter decoder address (decimal, default: 3, 0 for no decoder): ");
    io::stdout().flush().unwrap();

    let mut addr_input = String::new();
    io::stdin().read_line(&mut addr_input).unwrap();

    let decoder_address = match addr_input.trim() {
        "" => 3,
        s => s.parse::<u8>().unwrap_or_else(|_| {
            eprintln!("[WARNING] Invalid address '{}'. Using default 3.", s);
            3
        }),
    };

    let mut simulator = CommandStationSim::new();
    if decoder_address != 0 {
        simulator.attach_decoder(decoder_address);
        // CV8 carries the manufacturer ID; preload the NMRA DIY value
        // so service-mode reads have something to find.
        simulator.set_decoder_cv(8, 13);
        println!("Simulator started with decoder at address {decoder_address} (CV8 = 13)");
    } else {
        println!("Simulator started with an empty track");
    }

    // Main menu loop.
    loop {
        println!("\nSelect mode:");
        println!("  1. Manual Request Input");
        println!("  2. Listen on Serial Port");
        println!("  3. Exit");
        print!("> ");
        io::stdout().flush().unwrap();

        let mut choice = String::new();
        io::stdin().read_line(&mut choice).unwrap();

        match choice.trim() {
            "1" => run_manual_mode(&mut simulator),
            "2" => run_serial_mode(&mut simulator),
            "3" => break,
            _ => eprintln!("[ERROR] Invalid choice. Please enter 1, 2, or 3."),
        }
    }
}

// Handles the manual request input mode.
fn run_manual_mode(simulator: &mut CommandStationSim) {
    println!("\n--- Manual Mode ---");
    println!("Enter one JSON-RPC request per line, or type 'back' to return to the main menu.");
    println!("Example: {{\"method\":\"command_station_start\",\"params\":{{\"loop\":0}}}}");
    print!("> ");
    io::stdout().flush().unwrap();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let input = line.unwrap();
        let request = input.trim();

        if request == "back" {
            break;
        }

        if request.is_empty() {
            print!("> ");
            io::stdout().flush().unwrap();
            continue;
        }

        println!("< {}", simulator.process_line(request));
        print!("> ");
        io::stdout().flush().unwrap();
    }
}

// Handles the serial port listening mode.
fn run_serial_mode(simulator: &mut CommandStationSim) {
    println!("\n--- Serial Mode ---");

    // List available serial ports.
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("[ERROR] Could not enumerate serial ports: {}", e);
            return;
        }
    };

    if ports.is_empty() {
        eprintln!("[ERROR] No serial ports found.");
        return;
    }

    println!("Available serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port.port_name);
    }

    // Get user's choice of serial port.
    print!("Select a port (number): ");
    io::stdout().flush().unwrap();
    let mut port_choice = String::new();
    io::stdin().read_line(&mut port_choice).unwrap();
    let port_index: usize = match port_choice.trim().parse() {
        Ok(i) if i < ports.len() => i,
        _ => {
            eprintln!("[ERROR] Invalid port selection.");
            return;
        }
    };
    let port_name = &ports[port_index].port_name;

    // Get user's choice of baud rate.
    let baud_rates = [9600, 19200, 38400, 57600, 115200];
    println!("Available baud rates:");
    for (i, &rate) in baud_rates.iter().enumerate() {
        println!("  {}: {}", i, rate);
    }
    print!("Select a baud rate (number, default 115200): ");
    io::stdout().flush().unwrap();
    let mut baud_choice = String::new();
    io::stdin().read_line(&mut baud_choice).unwrap();
    let baud_rate = match baud_choice.trim() {
        "" => 115_200,
        s => match s.parse::<usize>() {
            Ok(i) if i < baud_rates.len() => baud_rates[i],
            _ => {
                eprintln!("[ERROR] Invalid baud rate selection.");
                return;
            }
        },
    };

    // Open the selected serial port.
    let mut port = match serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(10))
        .open()
    {
        Ok(port) => port,
        Err(e) => {
            eprintln!("[ERROR] Failed to open port '{}': {}", port_name, e);
            return;
        }
    };

    println!(
        "\nListening on {} at {} baud. Press Ctrl+C to exit.",
        port_name, baud_rate
    );

    // Requests can arrive fragmented; accumulate until a full line is in.
    let mut line_buf = String::new();
    let mut serial_buf: Vec<u8> = vec![0; 128];
    loop {
        match port.read(serial_buf.as_mut_slice()) {
            Ok(bytes_read) if bytes_read > 0 => {
                line_buf.push_str(&String::from_utf8_lossy(&serial_buf[..bytes_read]));
                while let Some(pos) = line_buf.find('\n') {
                    let line: String = line_buf.drain(..=pos).collect();
                    let request = line.trim();
                    if request.is_empty() {
                        continue;
                    }
                    println!("> Received: {}", request);
                    let mut response = simulator.process_line(request);
                    println!("< {}", response);
                    response.push_str("\r\n");
                    if let Err(e) = port.write_all(response.as_bytes()) {
                        eprintln!("[ERROR] Failed to write to serial port: {}", e);
                    }
                }
            }
            Ok(_) => (),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
            Err(e) => eprintln!("[ERROR] Serial port error: {}", e),
        }
    }
}
