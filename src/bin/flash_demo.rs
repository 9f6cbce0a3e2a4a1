//! Flash the LEDs of a simulated Simblee, mirroring the flow a front-end
//! would drive: fetch, connect, flash, disconnect, clean up. Ctrl-C
//! cancels the sequence; cleanup still runs.

use std::sync::Arc;
use std::time::Duration;

use simblee_ble::device::DeviceIdentifier;
use simblee_ble::logging::init_logger;
use simblee_ble::simulated::{
    SimulatedDriver, SimulatedSimbleeDeviceFactory, DRIVER_SIMULATED,
};
use simblee_ble::{with_connection, Color, ColorFlash, Driver, Settings, SimbleeCommands};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load_or_default("settings.json");
    let _logging = init_logger(&settings.log_settings)?;
    info!("starting flash demo");

    let driver = SimulatedDriver::new();
    driver.register_factory(Arc::new(SimulatedSimbleeDeviceFactory));

    let identifier = DeviceIdentifier::new(DRIVER_SIMULATED, "SIMBLEE");
    let device = driver
        .fetch_device(&identifier)
        .await
        .ok_or_else(|| anyhow::anyhow!("no device for {identifier}"))?;

    let flashing = with_connection(device, &settings.timeouts, |channel| async move {
        // Escalating blink pattern, then an uploaded flash sequence.
        for round in 1..=3u64 {
            let on = Duration::from_millis(round * 50 + 200);
            let off = Duration::from_millis(200);
            for _ in 0..4 {
                channel.set_color(Color::RED).await?;
                tokio::time::sleep(on).await;
                channel.set_color(Color::BLACK).await?;
                tokio::time::sleep(off).await;
            }
        }

        let sequence: Vec<ColorFlash> = (0..6)
            .map(|i| {
                let level = (i * 40) as u8;
                ColorFlash::new(
                    Color::rgb(level, 0xFF - level, 0x20),
                    Duration::from_millis(250),
                )
            })
            .collect();
        info!(entries = sequence.len(), "uploading flash sequence");
        channel.flash_colors(&sequence).await?;
        Ok(())
    });

    tokio::select! {
        result = flashing => {
            result?;
            info!("flash sequence complete");
        }
        _ = tokio::signal::ctrl_c() => {
            // with_connection's guard releases the connection.
            info!("cancelled");
        }
    }
    Ok(())
}
