use carrot_chatter::amqp::configuration::PublisherSettings;
use carrot_chatter::publishers::{MessageProperties, PublishError, Publisher};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // First of all we build the configuration for our publisher.
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image,
    // publishing to a transient topic exchange called `rabbit-chat`.
    let settings = PublisherSettings {
        app_id: Some("demo".into()),
        // Connections that stay unused for 2 seconds are closed.
        timeout: 2000,
        ..Default::default()
    };

    // We have a fluent API to customise our publisher step-by-step.
    // Publishing failures never surface from `publish` itself: they are handed over to an
    // error sink. Here we simply print them.
    let connection_factory =
        carrot_chatter::amqp::ConnectionFactory::new_from_config(&settings.broker)?;
    let publisher = Publisher::builder(connection_factory)
        .with_settings(&settings)
        .error_sink(|error: PublishError| eprintln!("Failed to publish: {error:?}"))
        .build();

    // `publish` returns immediately: messages are queued and sent one at a time, in order,
    // over a single reused connection.
    for i in 0..10 {
        publisher.publish(format!("Hello world #{i}"));
    }

    // A callback is invoked once the message has been handed over to the broker.
    // It is *not* invoked if publishing fails.
    publisher.publish_with_callback(
        "Hello again!",
        MessageProperties::default()
            .with_routing_key("greetings")
            .with_correlation_id("demo-correlation-id"),
        |_channel| println!("The last message has been published"),
    );

    // Wait for the queue to drain, then close the connection instead of waiting for the idle
    // timeout to do it for us.
    publisher.close().await;

    Ok(())
}
