//! Builds pipeline functions from configured stages.

use edgeflow_core::{
    batch::{Batch, BatchMode, FlushSink},
    context::Resources,
    continuation::ContinuationBuilder,
    envelope::{CONTENT_TYPE_JSON, CONTENT_TYPE_XML},
    function::{BoxError, PipelineFunction},
    publisher::{BackgroundPublisher, OutputRoute},
    retry::RetryStore,
    runtime::{self, RuntimeBuilder},
    transforms::{
        compression::{Algorithm, Compression},
        conversion::Conversion,
        encryption::Encryption,
        filter::Filter,
        logic::JsonLogic,
        output::OutputData,
        tags::Tags,
    },
};
use edgeflow_http::config::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to build stage {position} ({name}): {source}")]
    Stage {
        position: usize,
        name: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("Pipeline has no stages")]
    EmptyPipeline,
    #[error(transparent)]
    Runtime(#[from] runtime::Error),
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct DeviceNameFilter {
    pub device_names: Vec<String>,
    #[serde(default)]
    pub filter_out: bool,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct ReadingNameFilter {
    pub reading_names: Vec<String>,
    #[serde(default)]
    pub filter_out: bool,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct JsonLogicRule {
    /// JSONLogic rule as a JSON document.
    pub rule: String,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct AddTags {
    /// Comma separated `key:value` pairs.
    pub tags: String,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct AesEncryption {
    pub key: String,
    pub init_vector: String,
}

#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct SetOutputData {
    pub response_content_type: Option<String>,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct BatchByCount {
    pub batch_threshold: i64,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct BatchByTime {
    pub time_interval: String,
}

#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct BatchByTimeAndCount {
    pub time_interval: String,
    pub batch_threshold: i64,
}

/// Available pipeline stages.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
#[allow(non_camel_case_types)]
pub enum Stage {
    filter_by_device_name(DeviceNameFilter),
    filter_by_reading_name(ReadingNameFilter),
    json_logic(JsonLogicRule),
    /// Event to JSON text.
    transform_to_json,
    /// Event to XML text.
    transform_to_xml,
    add_tags(AddTags),
    compress_with_gzip,
    compress_with_zlib,
    encrypt_with_aes(AesEncryption),
    set_output_data(SetOutputData),
    batch_by_count(BatchByCount),
    batch_by_time(BatchByTime),
    batch_by_time_and_count(BatchByTimeAndCount),
    http_post(edgeflow_http::config::Sender),
    http_put(edgeflow_http::config::Sender),
    http_post_json(edgeflow_http::config::Sender),
    http_post_xml(edgeflow_http::config::Sender),
    http_put_json(edgeflow_http::config::Sender),
    http_put_xml(edgeflow_http::config::Sender),
    mqtt_send(edgeflow_mqtt::config::Sender),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::filter_by_device_name(_) => "filter_by_device_name",
            Stage::filter_by_reading_name(_) => "filter_by_reading_name",
            Stage::json_logic(_) => "json_logic",
            Stage::transform_to_json => "transform_to_json",
            Stage::transform_to_xml => "transform_to_xml",
            Stage::add_tags(_) => "add_tags",
            Stage::compress_with_gzip => "compress_with_gzip",
            Stage::compress_with_zlib => "compress_with_zlib",
            Stage::encrypt_with_aes(_) => "encrypt_with_aes",
            Stage::set_output_data(_) => "set_output_data",
            Stage::batch_by_count(_) => "batch_by_count",
            Stage::batch_by_time(_) => "batch_by_time",
            Stage::batch_by_time_and_count(_) => "batch_by_time_and_count",
            Stage::http_post(_) => "http_post",
            Stage::http_put(_) => "http_put",
            Stage::http_post_json(_) => "http_post_json",
            Stage::http_post_xml(_) => "http_post_xml",
            Stage::http_put_json(_) => "http_put_json",
            Stage::http_put_xml(_) => "http_put_xml",
            Stage::mqtt_send(_) => "mqtt_send",
        }
    }
}

/// Turns configured stages into pipeline functions.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
    resources: Arc<Resources>,
    publisher: Option<BackgroundPublisher>,
    output: OutputRoute,
    retry_store: Option<Arc<dyn RetryStore>>,
    http_client: Option<reqwest::Client>,
}

impl PipelineBuilder {
    pub fn new() -> PipelineBuilder {
        PipelineBuilder {
            ..Default::default()
        }
    }

    pub fn stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn resources(mut self, resources: Arc<Resources>) -> Self {
        self.resources = resources;
        self
    }

    /// Receives output of timer-flushed batches.
    pub fn publisher(mut self, publisher: Option<BackgroundPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// The trigger's output route, used for timer-flushed output when there is no publisher.
    pub fn output_route(mut self, output: OutputRoute) -> Self {
        self.output = output;
        self
    }

    pub fn retry_store(mut self, retry_store: Option<Arc<dyn RetryStore>>) -> Self {
        self.retry_store = retry_store;
        self
    }

    /// Shared by every HTTP stage.
    pub fn http_client(mut self, http_client: reqwest::Client) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// Builds the functions in order.
    ///
    /// Stages are built back to front so a batch stage can carry the
    /// stages after it for timer flushes.
    pub async fn build(self) -> Result<Vec<Arc<dyn PipelineFunction>>, Error> {
        if self.stages.is_empty() {
            return Err(Error::EmptyPipeline);
        }

        let mut tail: Vec<Arc<dyn PipelineFunction>> = Vec::with_capacity(self.stages.len());
        for (position, stage) in self.stages.iter().enumerate().rev() {
            let function = self
                .function(stage, &tail)
                .await
                .map_err(|source| Error::Stage {
                    position,
                    name: stage.name(),
                    source,
                })?;
            debug!(position, stage = stage.name(), "Built pipeline stage");
            tail.insert(0, function);
        }
        Ok(tail)
    }

    async fn function(
        &self,
        stage: &Stage,
        tail: &[Arc<dyn PipelineFunction>],
    ) -> Result<Arc<dyn PipelineFunction>, BoxError> {
        let function: Arc<dyn PipelineFunction> = match stage {
            Stage::filter_by_device_name(config) => Arc::new(Filter::by_device_name(
                config.device_names.clone(),
                config.filter_out,
            )),
            Stage::filter_by_reading_name(config) => Arc::new(Filter::by_reading_name(
                config.reading_names.clone(),
                config.filter_out,
            )),
            Stage::json_logic(config) => Arc::new(JsonLogic::new(&config.rule)?),
            Stage::transform_to_json => Arc::new(Conversion::to_json()),
            Stage::transform_to_xml => Arc::new(Conversion::to_xml()),
            Stage::add_tags(config) => Arc::new(Tags::parse(&config.tags)?),
            Stage::compress_with_gzip => Arc::new(Compression::new(Algorithm::Gzip)),
            Stage::compress_with_zlib => Arc::new(Compression::new(Algorithm::Zlib)),
            Stage::encrypt_with_aes(config) => {
                Arc::new(Encryption::new(&config.key, &config.init_vector)?)
            }
            Stage::set_output_data(config) => {
                Arc::new(OutputData::new(config.response_content_type.clone()))
            }
            Stage::http_post(config) => self.http_sender(config, Method::POST, None)?,
            Stage::http_put(config) => self.http_sender(config, Method::PUT, None)?,
            Stage::http_post_json(config) => {
                self.http_sender(config, Method::POST, Some(CONTENT_TYPE_JSON))?
            }
            Stage::http_post_xml(config) => {
                self.http_sender(config, Method::POST, Some(CONTENT_TYPE_XML))?
            }
            Stage::http_put_json(config) => {
                self.http_sender(config, Method::PUT, Some(CONTENT_TYPE_JSON))?
            }
            Stage::http_put_xml(config) => {
                self.http_sender(config, Method::PUT, Some(CONTENT_TYPE_XML))?
            }
            Stage::mqtt_send(config) => Arc::new(
                edgeflow_mqtt::sender::SenderBuilder::new()
                    .config(Arc::new(config.clone()))
                    .secrets(self.resources.secrets.clone())
                    .build()
                    .await?,
            ),
            Stage::batch_by_count(config) => {
                self.batch(stage, BatchMode::by_count(config.batch_threshold)?, tail)?
            }
            Stage::batch_by_time(config) => {
                self.batch(stage, BatchMode::by_time(&config.time_interval)?, tail)?
            }
            Stage::batch_by_time_and_count(config) => self.batch(
                stage,
                BatchMode::by_time_and_count(&config.time_interval, config.batch_threshold)?,
                tail,
            )?,
        };
        Ok(function)
    }

    /// Timer flushes run `tail` through a continuation.
    fn batch(
        &self,
        stage: &Stage,
        mode: BatchMode,
        tail: &[Arc<dyn PipelineFunction>],
    ) -> Result<Arc<dyn PipelineFunction>, BoxError> {
        let sink = self.continuation(tail)?;
        Ok(Arc::new(Batch::new(stage.name(), mode, Some(sink))?))
    }

    fn continuation(
        &self,
        tail: &[Arc<dyn PipelineFunction>],
    ) -> Result<Arc<dyn FlushSink>, BoxError> {
        let mut continuation = ContinuationBuilder::new()
            .resources(Arc::clone(&self.resources))
            .output_route(self.output.clone());
        if !tail.is_empty() {
            let runtime = RuntimeBuilder::new()
                .functions(tail.to_vec())
                .resources(Arc::clone(&self.resources))
                .build()?;
            continuation = continuation.tail(Arc::new(runtime));
        }
        if let Some(publisher) = &self.publisher {
            continuation = continuation.publisher(publisher.clone());
        }
        if let Some(retry_store) = &self.retry_store {
            continuation = continuation.retry_store(Arc::clone(retry_store));
        }
        Ok(Arc::new(continuation.build()))
    }

    fn http_sender(
        &self,
        config: &edgeflow_http::config::Sender,
        method: Method,
        mime_type: Option<&str>,
    ) -> Result<Arc<dyn PipelineFunction>, BoxError> {
        let mut config = config.clone();
        if let Some(mime_type) = mime_type {
            config.mime_type = mime_type.to_string();
        }
        let mut builder = edgeflow_http::sender::SenderBuilder::new()
            .config(Arc::new(config))
            .method(method);
        if let Some(client) = &self.http_client {
            builder = builder.client(client.clone());
        }
        Ok(Arc::new(builder.build()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflow_core::context::ResourcesBuilder;
    use edgeflow_core::envelope::EnvelopeBuilder;
    use edgeflow_core::publisher::background_publisher;
    use edgeflow_core::runtime::{Completion, Runtime};
    use edgeflow_core::publisher::OutputSink;
    use std::time::Duration;

    /// Forwards published output into a background queue the test reads from.
    struct Forward(BackgroundPublisher);

    #[async_trait::async_trait]
    impl OutputSink for Forward {
        async fn publish(
            &self,
            payload: Vec<u8>,
            correlation_id: &str,
            content_type: &str,
        ) -> Result<(), BoxError> {
            Ok(self.0.publish(payload, correlation_id, content_type).await?)
        }
    }

    const EVENT: &str = r#"{
        "id": "e1",
        "device": "Random-Integer-Device",
        "origin": 1,
        "readings": [
            { "id": "r1", "name": "Int8", "value": "12" },
            { "id": "r2", "name": "Int16", "value": "-3" }
        ]
    }"#;

    fn stages(json: &str) -> Vec<Stage> {
        serde_json::from_str(json).unwrap()
    }

    async fn runtime(builder: PipelineBuilder) -> Runtime {
        RuntimeBuilder::new()
            .functions(builder.build().await.unwrap())
            .build()
            .unwrap()
    }

    async fn run(runtime: &Runtime, payload: &str) -> (Completion, Option<Vec<u8>>) {
        let envelope = EnvelopeBuilder::new()
            .payload(payload.as_bytes().to_vec())
            .build()
            .unwrap();
        let mut ctx = runtime.context(&envelope);
        let completion = runtime.process(&mut ctx, &envelope).await.unwrap();
        (completion, ctx.take_output_data())
    }

    #[tokio::test]
    async fn test_filter_tag_and_output() {
        let runtime = runtime(PipelineBuilder::new().stages(stages(
            r#"[
                { "filter_by_reading_name": { "reading_names": ["Int8"] } },
                { "add_tags": { "tags": "site:plant-1" } },
                "transform_to_json",
                { "set_output_data": {} }
            ]"#,
        )))
        .await;

        let (completion, output) = run(&runtime, EVENT).await;
        assert_eq!(completion, Completion::Finished);
        let event: serde_json::Value = serde_json::from_slice(&output.unwrap()).unwrap();
        assert_eq!(event["readings"].as_array().unwrap().len(), 1);
        assert_eq!(event["tags"]["site"], "plant-1");
    }

    #[tokio::test]
    async fn test_filtered_out_device_stops() {
        let runtime = runtime(PipelineBuilder::new().stages(stages(
            r#"[
                { "filter_by_device_name": { "device_names": ["Random-Integer-Device"], "filter_out": true } },
                { "set_output_data": {} }
            ]"#,
        )))
        .await;

        let (completion, output) = run(&runtime, EVENT).await;
        assert_eq!(completion, Completion::Stopped { position: 0 });
        assert!(output.is_none());
    }

    #[tokio::test]
    async fn test_batch_by_count_flushes_to_tail() {
        let runtime = runtime(PipelineBuilder::new().stages(stages(
            r#"[
                { "batch_by_count": { "batch_threshold": 2 } },
                { "set_output_data": {} }
            ]"#,
        )))
        .await;

        let (first, _) = run(&runtime, r#"{"a":1}"#).await;
        assert_eq!(first, Completion::Pending { position: 0 });
        let (second, output) = run(&runtime, r#"{"a":2}"#).await;
        assert_eq!(second, Completion::Finished);
        let batch: serde_json::Value = serde_json::from_slice(&output.unwrap()).unwrap();
        assert_eq!(batch, serde_json::json!([{"a":1},{"a":2}]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_runs_tail_and_publishes() {
        let (publisher, mut receiver) = background_publisher(4).unwrap();
        let runtime = runtime(
            PipelineBuilder::new()
                .stages(stages(
                    r#"[
                        { "batch_by_time": { "time_interval": "10s" } },
                        { "set_output_data": {} }
                    ]"#,
                ))
                .publisher(Some(publisher)),
        )
        .await;

        let (completion, _) = run(&runtime, r#"{"a":1}"#).await;
        assert_eq!(completion, Completion::Pending { position: 0 });

        tokio::time::advance(Duration::from_secs(11)).await;
        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.payload(), br#"[{"a":1}]"#);
        runtime.shutdown().await;
    }

    /// Builds `builder`, which is expected to fail.
    async fn build_err(builder: PipelineBuilder) -> Error {
        let Err(err) = builder.build().await else {
            panic!("expected the pipeline build to fail");
        };
        err
    }

    #[tokio::test]
    async fn test_stage_error_names_position() {
        let err = build_err(PipelineBuilder::new().stages(stages(
            r#"[
                "transform_to_json",
                { "add_tags": { "tags": "site" } }
            ]"#,
        )))
        .await;
        assert!(matches!(
            err,
            Error::Stage { position: 1, name: "add_tags", .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_batch_and_sender_config() {
        let err = build_err(
            PipelineBuilder::new()
                .stages(stages(r#"[{ "batch_by_count": { "batch_threshold": 0 } }]"#)),
        )
        .await;
        assert!(matches!(err, Error::Stage { position: 0, .. }));

        let err = build_err(PipelineBuilder::new().stages(stages(
            r#"[{ "http_post": { "url": "http://localhost", "secret_header_name": "X-Key" } }]"#,
        )))
        .await;
        assert_eq!(
            err.to_string(),
            "Failed to build stage 0 (http_post): HTTP Header Secret Name was provided but no SecretPath was provided"
        );
    }

    #[tokio::test]
    async fn test_empty_pipeline() {
        let err = build_err(
            PipelineBuilder::new().resources(ResourcesBuilder::new().name("empty").build()),
        )
        .await;
        assert!(matches!(err, Error::EmptyPipeline));
    }

    #[tokio::test]
    async fn test_invalid_json_logic_rule() {
        let err = build_err(
            PipelineBuilder::new().stages(stages(r#"[{ "json_logic": { "rule": "{ nope" } }]"#)),
        )
        .await;
        assert!(matches!(err, Error::Stage { position: 0, name: "json_logic", .. }));
    }

    #[tokio::test]
    async fn test_json_logic_then_xml_output() {
        let runtime = runtime(PipelineBuilder::new().stages(stages(
            r#"[
                { "json_logic": { "rule": "{ \"==\": [{ \"var\": \"device\" }, \"Random-Integer-Device\"] }" } },
                "transform_to_xml",
                { "set_output_data": {} }
            ]"#,
        )))
        .await;

        let (completion, output) = run(&runtime, EVENT).await;
        assert_eq!(completion, Completion::Finished);
        let xml = String::from_utf8(output.unwrap()).unwrap();
        assert!(xml.starts_with("<Event>"), "{xml}");
        assert!(xml.contains("<device>Random-Integer-Device</device>"), "{xml}");

        let (completion, output) = run(&runtime, r#"{"device":"other","readings":[]}"#).await;
        assert_eq!(completion, Completion::Stopped { position: 0 });
        assert!(output.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_without_publisher_uses_output_route() {
        let route = OutputRoute::new();
        let runtime = runtime(
            PipelineBuilder::new()
                .stages(stages(
                    r#"[
                        { "batch_by_time": { "time_interval": "10s" } },
                        { "set_output_data": {} }
                    ]"#,
                ))
                .publisher(None)
                .output_route(route.clone()),
        )
        .await;
        let (publisher, mut receiver) = background_publisher(4).unwrap();
        route.attach(Arc::new(Forward(publisher)));

        let (completion, _) = run(&runtime, r#"{"a":1}"#).await;
        assert_eq!(completion, Completion::Pending { position: 0 });

        tokio::time::advance(Duration::from_secs(11)).await;
        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.payload(), br#"[{"a":1}]"#);
        runtime.shutdown().await;
    }
}
