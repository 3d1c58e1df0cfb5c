use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue broker
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Queue backend: "redis" (multi-process) or "memory" (single-process)
    #[serde(default = "default_queue_backend")]
    pub queue_backend: String,

    /// Pending-job cap before enqueue reports backpressure
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// S3-compatible bucket holding raw photo bytes
    pub s3_bucket: String,

    /// S3 endpoint URL
    pub s3_endpoint: String,

    /// S3 access key ID
    pub s3_access_key: String,

    /// S3 secret access key
    pub s3_secret_key: String,

    /// AES-256-GCM encryption key (base64-encoded, 32 bytes)
    pub encryption_key: String,

    /// Inference backend: "remote" (batch OCR server) or "ollama" (local multimodal LLM)
    #[serde(default = "default_inference_backend")]
    pub inference_backend: String,

    /// Base URL of the inference backend
    #[serde(default = "default_inference_url")]
    pub inference_url: String,

    /// Model name when the ollama backend is selected
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,

    /// Per-request timeout against the inference backend
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    /// Jobs fetched per worker cycle; bounds inference-backend memory use
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a dequeued job stays invisible before automatic recovery
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Failed attempts allowed before a job is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minimum extraction confidence for a result to be accepted
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Base delay for retry backoff
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    /// Queue depth that triggers scale-out when sustained
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: u64,

    /// Queue depth that triggers scale-in when sustained
    #[serde(default = "default_queue_low_water")]
    pub queue_low_water: u64,

    /// Worker pool lower bound
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Worker pool upper bound
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Seconds between queue-depth samples in the pool control loop
    #[serde(default = "default_scale_sample_interval_secs")]
    pub scale_sample_interval_secs: u64,

    /// Consecutive samples required before a scaling action
    #[serde(default = "default_scale_sample_window")]
    pub scale_sample_window: usize,

    /// Optional Prometheus scrape address for the worker binary
    #[serde(default)]
    pub worker_metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_queue_backend() -> String {
    "redis".to_string()
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_inference_backend() -> String {
    "remote".to_string()
}

fn default_inference_url() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_ollama_model() -> String {
    "qwen3-vl:8b".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    16
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_confidence_threshold() -> f64 {
    0.95
}

fn default_retry_base_delay_secs() -> u64 {
    5
}

fn default_queue_high_water() -> u64 {
    100
}

fn default_queue_low_water() -> u64 {
    10
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    8
}

fn default_scale_sample_interval_secs() -> u64 {
    5
}

fn default_scale_sample_window() -> usize {
    3
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
