use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mvirt_netdev::config::{NetdevConfig, PortConfig};
use mvirt_netdev::descriptor::{BufferDescriptor, rx_flags};
use mvirt_netdev::device::{DeviceClass, FrameType, MacAddress};
use mvirt_netdev::fifo::FifoEnd;
use mvirt_netdev::test_util::{FakeNetworkDevice, FakeNetworkPort};
use mvirt_netdev::vmo::Vmo;
use mvirt_netdev::{DeviceInterface, SessionFlags, SessionHandle, SessionInfo};

/// Size of each client buffer.
const BUFFER_SIZE: u64 = 2048;

/// How long to wait for the data path.
const WAIT: Duration = Duration::from_secs(5);

/// Local experimental ethertype used for demo frames.
const DEMO_ETHERTYPE: [u8; 2] = [0x88, 0xb5];

#[derive(Parser)]
#[command(name = "mvirt-netdev")]
#[command(about = "Loop frames through a fake network device and the session multiplexer")]
struct Args {
    /// Device configuration (JSON); defaults to one Ethernet port with id 0
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of frames to send
    #[arg(short, long, default_value_t = 8)]
    frames: u16,

    /// Frame length in bytes, including the Ethernet header
    #[arg(long, default_value_t = 64)]
    frame_size: usize,
}

fn default_config() -> NetdevConfig {
    NetdevConfig {
        ports: vec![PortConfig {
            id: 0,
            class: DeviceClass::Ethernet,
            rx_types: vec![FrameType::Ethernet],
            tx_types: vec![FrameType::Ethernet],
            mtu: 1500,
            online: true,
            mac: Some([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
        }],
        ..NetdevConfig::default()
    }
}

fn demo_frame(seq: u16, size: usize, src: MacAddress) -> Vec<u8> {
    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&DEMO_ETHERTYPE);
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.resize(size.max(frame.len()), (seq & 0xff) as u8);
    frame
}

/// Hand descriptors `first..first + count` to the session as rx space.
fn offer_rx(handle: &SessionHandle, fifo: &FifoEnd, first: u16, count: u16) -> anyhow::Result<()> {
    let indices: Vec<u16> = (first..first + count).collect();
    for &index in &indices {
        let desc = BufferDescriptor::new(u64::from(index) * BUFFER_SIZE, BUFFER_SIZE as u32);
        handle.descriptors().set(index, &desc)?;
    }
    let written = fifo.write(&indices)?;
    if written != indices.len() {
        bail!("rx FIFO accepted {written} of {} descriptors", indices.len());
    }
    Ok(())
}

/// Drain completed descriptors from `fifo` until `expected` arrive or the
/// wait expires.
fn collect(fifo: &FifoEnd, expected: usize) -> Vec<u16> {
    let mut completed = Vec::with_capacity(expected);
    while completed.len() < expected {
        match fifo.read_timeout(WAIT) {
            Ok(index) => completed.push(index),
            Err(e) => {
                warn!(error = %e, received = completed.len(), expected, "Stopped waiting for completions");
                break;
            }
        }
    }
    completed
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NetdevConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => default_config(),
    };
    let port = config.ports.first().cloned().context("Config has no ports")?;
    if args.frame_size < 16 || args.frame_size as u64 > BUFFER_SIZE {
        bail!("frame size must be between 16 and {BUFFER_SIZE}");
    }
    let frames = args.frames.clamp(1, 512);

    let driver = FakeNetworkDevice::with_info(config.device.clone());
    let device = DeviceInterface::create(driver.clone()).context("Failed to create device interface")?;
    for port in &config.ports {
        driver.add_port(
            port.id,
            Arc::new(FakeNetworkPort::new(port.info(), port.status(), port.mac)),
        );
    }
    let binding = device.bind()?;
    info!(ports = config.ports.len(), "Device ready");

    // Primary session: first half of the ring is rx space, second half tx
    let primary_data = Vmo::create(usize::from(frames) * 2 * BUFFER_SIZE as usize)?;
    let (primary, primary_fifos) =
        binding.open_session("demo-primary", SessionInfo::new(primary_data.clone(), frames * 2))?;
    // Listen session sees both the echoed tx frames and the received copies
    let listen_data = Vmo::create(usize::from(frames) * 2 * BUFFER_SIZE as usize)?;
    let (listen, listen_fifos) = binding.open_session(
        "demo-listen",
        SessionInfo::new(listen_data.clone(), frames * 2).with_flags(SessionFlags::LISTEN_TX),
    )?;

    primary.attach(port.id, &[FrameType::Ethernet])?;
    listen.attach(port.id, &[FrameType::Ethernet])?;
    offer_rx(&primary, &primary_fifos.rx, 0, frames)?;
    offer_rx(&listen, &listen_fifos.rx, 0, frames * 2)?;
    if !driver.wait_rx_space(usize::from(frames), WAIT) {
        bail!("device never received rx space");
    }

    let src = port.mac.unwrap_or([0x02, 0, 0, 0, 0, 0x01]);
    let mut tx_indices = Vec::with_capacity(usize::from(frames));
    for seq in 0..frames {
        let index = frames + seq;
        let offset = u64::from(index) * BUFFER_SIZE;
        let frame = demo_frame(seq, args.frame_size, src);
        primary_data.write(offset, &frame)?;
        let desc = BufferDescriptor {
            port_id: port.id,
            frame_type: FrameType::Ethernet.raw(),
            ..BufferDescriptor::new(offset, frame.len() as u32)
        };
        primary.descriptors().set(index, &desc)?;
        tx_indices.push(index);
    }
    primary_fifos.tx.write(&tx_indices)?;
    if !driver.wait_tx(usize::from(frames), WAIT) {
        bail!("device never received tx frames");
    }
    let looped = driver.loop_back();
    info!(looped, "Frames looped back by the device");

    let tx_done = collect(&primary_fifos.tx, usize::from(frames));
    let failed = tx_done
        .iter()
        .filter_map(|&i| primary.descriptors().get(i))
        .filter(|d| d.return_flags != 0)
        .count();
    let rx_done = collect(&primary_fifos.rx, looped);
    let mut intact = 0;
    for &index in &rx_done {
        let Some(desc) = primary.descriptors().get(index) else {
            continue;
        };
        let data = primary_data.read_vec(desc.data_offset(), desc.data_length as usize)?;
        if data.get(..14).is_some_and(|h| h[12..14] == DEMO_ETHERTYPE) {
            intact += 1;
        }
    }
    let listened = collect(&listen_fifos.rx, usize::from(frames) + looped);
    let echoed = listened
        .iter()
        .filter_map(|&i| listen.descriptors().get(i))
        .filter(|d| d.inbound_flags & rx_flags::RX_ECHOED_TX != 0)
        .count();
    info!(
        sent = frames,
        tx_completed = tx_done.len(),
        tx_failed = failed,
        received = rx_done.len(),
        intact,
        listen_copies = listened.len(),
        echoed,
        "Loopback finished"
    );

    let snapshot = device.snapshot();
    info!(?snapshot, "Device state before teardown");

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    device.teardown(move || {
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(WAIT)
        .context("Teardown did not finish")?;
    drop(binding);
    info!(teardown = %device.teardown_state(), "Device torn down");
    Ok(())
}
