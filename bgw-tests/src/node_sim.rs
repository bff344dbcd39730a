//! Runs an in-process gateway and drives two simulated reader nodes over
//! TCP through a full hand-off: node A claims and serves a wearable, the
//! wearable walks out of A's range and node B picks it up.

use bgw_broker::{gateway, ClientSubscribe, GatewayOptions, ListDevices, LocalAddr};
use bgwp_node::{
    timestamp_now, DeviceAddress, DeviceData, GatewayMessage, NodeClient, NodeConfig,
    NodeDirectives, NodeId,
};
use tokio::time::Duration;

async fn expect_directive(
    node: &NodeId,
    directives: &mut NodeDirectives,
) -> Result<GatewayMessage, Box<dyn std::error::Error>> {
    let msg = tokio::time::timeout(Duration::from_secs(5), directives.next())
        .await?
        .ok_or("gateway closed the connection")?;
    log::info!("{node:} <- {msg:?}");
    Ok(msg)
}

#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    log::info!("Initializing gateway");

    let handle = gateway(GatewayOptions::default().with_listen("127.0.0.1:0")?)
        .await
        .map_err(|e| {
            log::error!("Error creating gateway & handle {e:}");
            e
        })?;
    let listen = handle.send(LocalAddr).await?;

    let (cloud_tx, mut cloud_rx) = tokio::sync::mpsc::unbounded_channel();
    handle
        .send(ClientSubscribe {
            id: 0,
            cloud_events: cloud_tx,
        })
        .await
        .map_err(|e| {
            log::error!("Error sending client subscribe request {e:}");
            e
        })??;
    tokio::spawn(async move {
        while let Some(event) = cloud_rx.recv().await {
            log::info!("cloud: {event:?}");
        }
    });

    let wearable = DeviceAddress::parse("c0:ff:ee:00:00:01")?;
    let config = |location: &str| NodeConfig {
        location: Some(location.to_string()),
        range: Some(5.0),
        ..Default::default()
    };

    let (mut node_a, mut directives_a) =
        NodeClient::connect(listen, NodeId::new("reader-a"), config("gate")).await?;
    let (mut node_b, mut directives_b) =
        NodeClient::connect(listen, NodeId::new("reader-b"), config("yard")).await?;
    let a = node_a.node_id().clone();
    let b = node_b.node_id().clone();

    // both readers see the wearable, only A may connect
    node_a.discovered(wearable.clone(), 1.2, timestamp_now()).await?;
    node_b.discovered(wearable.clone(), 4.0, timestamp_now()).await?;
    expect_directive(&a, &mut directives_a).await?;

    node_a.connected(wearable.clone(), timestamp_now()).await?;
    for i in 0..3 {
        node_a
            .status(
                wearable.clone(),
                1.0 + i as f64,
                timestamp_now(),
                DeviceData {
                    battery_level: Some(90 - i),
                    hazardous: Some(i == 2),
                    ..Default::default()
                },
            )
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    node_a.out_of_range(wearable.clone(), timestamp_now()).await?;
    expect_directive(&a, &mut directives_a).await?;

    node_b.discovered(wearable.clone(), 2.0, timestamp_now()).await?;
    expect_directive(&b, &mut directives_b).await?;
    node_b.connected(wearable.clone(), timestamp_now()).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    for device in handle.send(ListDevices).await?? {
        log::info!(
            "{} {:?} owner {:?}",
            device.address,
            device.state,
            device.owner
        );
    }

    Ok(())
}
