//! Configuración leída de variables de entorno.
//!
//! Cada struct tiene un `Default` con los valores por defecto y un
//! `from_env()` que pisa los campos cuya variable está definida y parsea bien.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Lee y parsea `key`; si no está o es inválida, devuelve `default`.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("ignorando {}={:?}: valor inválido", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

pub const DEFAULT_SEGMENT_TOPIC: &str = "segments";

/// Reintentos acotados con backoff exponencial.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// `attempts_var` nombra la variable del tope de intentos de este uso.
    pub fn from_env(attempts_var: &str) -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_or(attempts_var, d.max_attempts).max(1),
            base_delay: env_millis("RETRY_BASE_MS", d.base_delay),
            max_delay: d.max_delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub topic: String,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_SEGMENT_TOPIC.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        Self {
            topic: env_string("SEGMENT_TOPIC", DEFAULT_SEGMENT_TOPIC),
            retry: RetryPolicy::from_env("PUBLISH_ATTEMPTS"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    /// Entregas de un segmento antes de marcarlo FAILED para siempre.
    pub max_attempts: u32,
    /// Handlers en paralelo dentro de un mismo consumer.
    pub concurrency: usize,
    /// Espera cuando la cola no tiene nada.
    pub idle_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_SEGMENT_TOPIC.to_string(),
            max_attempts: 3,
            concurrency: 2,
            idle_interval: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            topic: env_string("SEGMENT_TOPIC", DEFAULT_SEGMENT_TOPIC),
            max_attempts: env_or("MAX_SEGMENT_ATTEMPTS", d.max_attempts).max(1),
            concurrency: env_or("WORKER_CONCURRENCY", d.concurrency).max(1),
            idle_interval: d.idle_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_initial: Duration,
    pub poll_max: Duration,
    /// Tiempo máximo entre el dispatch y la finalización.
    pub max_wait: Duration,
    /// Reintentos al leer resultados por segmento y escribir el resumen.
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_initial: Duration::from_millis(500),
            poll_max: Duration::from_secs(10),
            max_wait: Duration::from_secs(2 * 60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_initial: env_millis("POLL_INITIAL_MS", d.poll_initial),
            poll_max: env_millis("POLL_MAX_MS", d.poll_max),
            max_wait: env_secs("TASK_MAX_WAIT_SECS", d.max_wait),
            retry: RetryPolicy::from_env("STORE_ATTEMPTS"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Una entrega sin ack dentro de este plazo se vuelve a entregar.
    pub ack_deadline: Duration,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            ack_deadline: env_secs("ACK_DEADLINE_SECS", d.ack_deadline),
            sweep_interval: env_secs("REDELIVERY_SWEEP_SECS", d.sweep_interval),
        }
    }
}
