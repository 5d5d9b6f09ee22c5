use lapin::{options::ConfirmSelectOptions, Channel, Connection};
use tracing::{error, info};

pub struct ChannelProvider;

impl ChannelProvider {
    /// Opens a channel in publisher-confirm mode, so every publish reports
    /// whether the broker accepted the message.
    pub async fn create_channel(connection: &Connection) -> Result<Channel, lapin::Error> {
        info!("Creating RabbitMQ channel");

        let channel = connection.create_channel().await.map_err(|e| {
            error!(error = %e, "Failed to create RabbitMQ channel");
            e
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                error!(error = %e, channel_id = channel.id(), "Failed to enable publisher confirms");
                e
            })?;

        info!(channel_id = channel.id(), "Channel created with publisher confirms");

        Ok(channel)
    }

    pub async fn close_channel(channel: Channel) -> Result<(), lapin::Error> {
        let channel_id = channel.id();
        info!(channel_id, "Closing RabbitMQ channel");

        channel.close(200, "Normal shutdown").await.map_err(|e| {
            error!(error = %e, channel_id, "Failed to close channel gracefully");
            e
        })?;

        info!(channel_id, "Channel closed successfully");
        Ok(())
    }
}
