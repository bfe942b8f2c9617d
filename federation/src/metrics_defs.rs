//! Metrics definitions for key federation sync.

use shared::metrics_defs::{MetricDef, MetricType};

pub const UPLOAD_KEYS: MetricDef = MetricDef {
    name: "upload.keys",
    metric_type: MetricType::Counter,
    description: "Number of keys sent to the federation gateway, tagged by test type",
};

pub const UPLOAD_KEYS_REJECTED: MetricDef = MetricDef {
    name: "upload.keys.rejected",
    metric_type: MetricType::Counter,
    description: "Number of local keys dropped before upload, tagged by rule",
};

pub const UPLOAD_BATCHES: MetricDef = MetricDef {
    name: "upload.batches",
    metric_type: MetricType::Counter,
    description: "Number of signed batches accepted by the federation gateway",
};

pub const UPLOAD_INCOMPLETE: MetricDef = MetricDef {
    name: "upload.incomplete",
    metric_type: MetricType::Counter,
    description: "Number of uploads where the gateway inserted fewer keys than were sent",
};

pub const DOWNLOAD_KEYS_ACCEPTED: MetricDef = MetricDef {
    name: "download.keys.accepted",
    metric_type: MetricType::Counter,
    description: "Number of downloaded keys that passed validation, tagged by origin",
};

pub const DOWNLOAD_KEYS_REJECTED: MetricDef = MetricDef {
    name: "download.keys.rejected",
    metric_type: MetricType::Counter,
    description: "Number of downloaded keys that failed validation, tagged by rule",
};

pub const DOWNLOAD_BATCHES: MetricDef = MetricDef {
    name: "download.batches",
    metric_type: MetricType::Counter,
    description: "Number of download pages fully processed",
};

pub const DOWNLOAD_ORIGIN_REJECTED: MetricDef = MetricDef {
    name: "download.origin.rejected",
    metric_type: MetricType::Counter,
    description: "Number of origin groups discarded because the origin is not allowed",
};

pub const INTEROP_REQUEST_DURATION: MetricDef = MetricDef {
    name: "interop.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time taken by federation gateway requests in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    UPLOAD_KEYS,
    UPLOAD_KEYS_REJECTED,
    UPLOAD_BATCHES,
    UPLOAD_INCOMPLETE,
    DOWNLOAD_KEYS_ACCEPTED,
    DOWNLOAD_KEYS_REJECTED,
    DOWNLOAD_BATCHES,
    DOWNLOAD_ORIGIN_REJECTED,
    INTEROP_REQUEST_DURATION,
];
