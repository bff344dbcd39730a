use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpStream, ToSocketAddrs},
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
};

use crate::{
    codec, DeviceAddress, DeviceData, GatewayMessage, NodeConfig, NodeId, NodeMessage, ProtoError,
    Timestamp,
};

/// Reader-side end of the gateway connection. Registers on connect; every
/// report after that goes out in call order over the same socket.
pub struct NodeClient {
    node_id: NodeId,
    writer: OwnedWriteHalf,
    _reader: tokio::task::JoinHandle<()>,
}

/// Directives the gateway pushes down to this node
pub struct NodeDirectives(UnboundedReceiver<GatewayMessage>);

impl NodeDirectives {
    /// Returns `None` once the gateway closes the connection
    pub async fn next(&mut self) -> Option<GatewayMessage> {
        self.0.recv().await
    }
}

impl NodeClient {
    pub async fn connect<A: ToSocketAddrs>(
        gateway: A,
        node_id: NodeId,
        config: NodeConfig,
    ) -> Result<(Self, NodeDirectives), ProtoError> {
        let stream = TcpStream::connect(gateway).await?;
        let (read_half, writer) = stream.into_split();
        let (sender, receiver) = unbounded_channel();

        let id = node_id.clone();
        let _reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match codec::decode::<GatewayMessage>(&line) {
                        Ok(msg) => {
                            log::trace!("node {id:} got directive {msg:?}");
                            if sender.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("node {id:} dropping undecodable directive: {e:}");
                        }
                    },
                    Ok(None) => {
                        log::info!("node {id:}: gateway closed the connection");
                        break;
                    }
                    Err(e) => {
                        log::error!("node {id:}: socket error {e:}");
                        break;
                    }
                }
            }
        });

        let mut client = Self {
            node_id: node_id.clone(),
            writer,
            _reader,
        };
        client
            .send(&NodeMessage::Register {
                node_id: Some(node_id),
                config_data: config,
            })
            .await?;

        Ok((client, NodeDirectives(receiver)))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub async fn send(&mut self, msg: &NodeMessage) -> Result<(), ProtoError> {
        log::trace!("node {} sending {}", self.node_id, msg.kind());
        codec::write_frame(&mut self.writer, msg).await
    }

    pub async fn discovered(
        &mut self,
        device_address: DeviceAddress,
        distance: f64,
        timestamp: Timestamp,
    ) -> Result<(), ProtoError> {
        self.send(&NodeMessage::Discovered {
            device_address,
            distance,
            timestamp,
        })
        .await
    }

    pub async fn connected(
        &mut self,
        device_address: DeviceAddress,
        timestamp: Timestamp,
    ) -> Result<(), ProtoError> {
        self.send(&NodeMessage::DeviceConnected {
            device_address,
            timestamp,
        })
        .await
    }

    pub async fn status(
        &mut self,
        device_address: DeviceAddress,
        distance: f64,
        timestamp: Timestamp,
        data: DeviceData,
    ) -> Result<(), ProtoError> {
        self.send(&NodeMessage::DeviceStatus {
            device_address,
            distance,
            timestamp,
            data,
        })
        .await
    }

    pub async fn out_of_range(
        &mut self,
        device_address: DeviceAddress,
        timestamp: Timestamp,
    ) -> Result<(), ProtoError> {
        self.send(&NodeMessage::DeviceOutOfRange {
            device_address,
            timestamp,
        })
        .await
    }

    pub async fn disconnected(&mut self, device_address: DeviceAddress) -> Result<(), ProtoError> {
        self.send(&NodeMessage::DeviceDisconnected { device_address })
            .await
    }
}

impl Drop for NodeClient {
    fn drop(&mut self) {
        self._reader.abort();
    }
}
