use std::process::exit;

use anyhow::{bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use log::LevelFilter;

#[cfg(feature = "bluez")]
use stringart_link::BleConnector;
use stringart_link::{
    decode_payload, encode, list_ports, logging, Connector, Delivery, MismatchPolicy,
    MotorFields, Protocol, Rig, SerialConnector, TransportConfig, MOTOR_COUNT,
};

#[derive(Parser, Debug)]
#[command(name = "stringart", about = "Drive the StringArt stepper rig over BLE or serial")]
struct Args {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Print the frame for the given motors without connecting
    Encode {
        #[command(flatten)]
        motors: MotorArgs,
        /// Print the decoded motor programs as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send motor programs
    Send {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        motors: MotorArgs,
    },
    /// Start the loaded programs
    Start {
        #[command(flatten)]
        target: Target,
    },
    /// Pause the running programs
    Pause {
        #[command(flatten)]
        target: Target,
    },
    /// Send motor programs, then start them
    Run {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        motors: MotorArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct MotorArgs {
    /// Motor fields REVS RPM DIR, each '/'-separated for multi-step programs.
    /// Repeat for M1..M4; use "" for an empty field, missing motors stay empty.
    #[arg(short = 'm', long = "motor", num_args = 3, value_names = ["REVS", "RPM", "DIR"])]
    motor: Vec<String>,
    /// Pad shorter step lists with their first value instead of rejecting
    #[arg(long)]
    pad: bool,
}

impl MotorArgs {
    fn fields(&self) -> Result<[MotorFields; MOTOR_COUNT]> {
        if self.motor.len() > MOTOR_COUNT * 3 {
            bail!("at most {MOTOR_COUNT} motors");
        }
        let mut motors: [MotorFields; MOTOR_COUNT] = Default::default();
        for (slot, values) in motors.iter_mut().zip(self.motor.chunks(3)) {
            if let [magnitude, rate, direction] = values {
                *slot = MotorFields::new(magnitude.as_str(), rate.as_str(), direction.as_str());
            }
        }
        Ok(motors)
    }

    fn policy(&self) -> MismatchPolicy {
        if self.pad {
            MismatchPolicy::PadWithFirst
        } else {
            MismatchPolicy::Reject
        }
    }
}

#[derive(ClapArgs, Debug)]
struct Target {
    /// Serial port of the rig (e.g. /dev/ttyUSB0)
    #[arg(long, conflicts_with = "ble")]
    port: Option<String>,
    /// Connect over BLE to the UART bridge
    #[arg(long)]
    ble: bool,
    /// Only accept a BLE device with this name
    #[arg(long, requires = "ble")]
    name: Option<String>,
    /// Prefix frames with DATA:/CMD: and wait for ACK:* tokens
    #[arg(long)]
    tagged: bool,
    /// Never wait for acknowledgements
    #[arg(long)]
    no_ack: bool,
}

impl Target {
    fn protocol(&self) -> Protocol {
        match (self.tagged, self.no_ack) {
            (_, true) => Protocol {
                tagged: self.tagged,
                ..Protocol::unacknowledged()
            },
            (true, false) => Protocol::tagged(),
            (false, false) => Protocol::default(),
        }
    }

    fn connector(&self) -> Result<Box<dyn Connector>> {
        if let Some(port) = &self.port {
            return Ok(Box::new(SerialConnector::new(port.as_str())));
        }
        if self.ble {
            return ble_connector(self.name.clone());
        }
        bail!("choose a target: --port <PATH> or --ble")
    }
}

#[cfg(feature = "bluez")]
fn ble_connector(name: Option<String>) -> Result<Box<dyn Connector>> {
    let mut connector = BleConnector::default();
    connector.name = name;
    Ok(Box::new(connector))
}

#[cfg(not(feature = "bluez"))]
fn ble_connector(_name: Option<String>) -> Result<Box<dyn Connector>> {
    bail!("BLE support not compiled in (rebuild with --features bluez)")
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    match args.verbose {
        0 => logging::init_rust_logging(),
        1 => logging::init_rust_logging_at(LevelFilter::Debug),
        _ => logging::init_rust_logging_at(LevelFilter::Trace),
    }

    match args.command {
        Command::Ports => {
            let ports = list_ports()?;
            if ports.is_empty() {
                println!("No serial ports found.");
            }
            for port in ports {
                println!("{port}");
            }
            Ok(())
        }
        Command::Encode { motors, json } => {
            let frame = encode(&motors.fields()?, motors.policy())?;
            if json {
                let specs = decode_payload(frame.payload())?;
                println!("{}", serde_json::to_string_pretty(&specs)?);
            } else {
                print!("{}", frame.payload());
            }
            Ok(())
        }
        Command::Send { target, motors } => {
            let fields = motors.fields()?;
            with_rig(&target, motors.policy(), |rig| async move {
                report(rig.send_motors(&fields).await?);
                Ok(())
            })
            .await
        }
        Command::Start { target } => {
            with_rig(&target, MismatchPolicy::Reject, |rig| async move {
                report(rig.start().await?);
                Ok(())
            })
            .await
        }
        Command::Pause { target } => {
            with_rig(&target, MismatchPolicy::Reject, |rig| async move {
                report(rig.pause().await?);
                Ok(())
            })
            .await
        }
        Command::Run { target, motors } => {
            let fields = motors.fields()?;
            with_rig(&target, motors.policy(), |rig| async move {
                report(rig.send_motors(&fields).await?);
                report(rig.start().await?);
                Ok(())
            })
            .await
        }
    }
}

/// Connect, run `action`, and always disconnect afterwards.
async fn with_rig<F, Fut>(target: &Target, policy: MismatchPolicy, action: F) -> Result<()>
where
    F: FnOnce(std::sync::Arc<Rig>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let config = TransportConfig::default()
        .with_protocol(target.protocol())
        .with_mismatch_policy(policy);
    let rig = std::sync::Arc::new(Rig::new(target.connector()?, config));

    let device = rig.connect().await?;
    println!("Connected to {}", device.label());

    let result = action(rig.clone()).await;
    println!("{}", rig.status().message());

    if rig.device().is_some() {
        rig.disconnect().await?;
    }
    result
}

fn report(delivery: Delivery) {
    match delivery {
        Delivery::Confirmed => println!("Delivered, confirmed by the rig."),
        Delivery::Sent => println!("Delivered."),
        Delivery::Unconfirmed => println!("Delivered, but the rig did not confirm."),
    }
}
