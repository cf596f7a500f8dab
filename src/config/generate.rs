pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOGSHIP CONFIGURATION
# =============================================================================
# This file configures which write-ahead log to tail and where to ship the
# entries it contains.
#
# Every client gets its own WAL watcher, send queue and segment marker, so a
# slow or unreachable endpoint never holds back the others.
#
# Values of the form $env{VAR_NAME} are replaced with environment variables
# before parsing.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logship/config.yml
#   3. /etc/logship/config.yml

# =============================================================================
# WAL SETTINGS
# =============================================================================

wal:
  # Directory holding the WAL segments. Segment markers are kept under
  # <dir>/remote/<client name>/.
  dir: /var/lib/logship/wal
  # Read every watcher to the end of the WAL before stopping. When false,
  # shutdown is immediate and unsent entries are replayed after a restart.
  drain_on_shutdown: true
  watch:
    # Backup read timer, doubled on every idle tick up to the maximum
    min_read_frequency: 250ms
    max_read_frequency: 1s
    # Upper bound on how long a drain may take
    drain_timeout: 15s

# =============================================================================
# LIMITS (optional)
# =============================================================================
# Applied to every entry before batching. 0 disables a limit.

limits:
  max_streams: 0
  max_line_size: 0
  # Truncate oversized lines instead of dropping them
  max_line_size_truncate: false

# =============================================================================
# CLIENTS
# =============================================================================
# At least one client is required. Names must be unique; an unnamed client is
# named after a hash of its config.

clients:
  - name: default
    url: http://localhost:3100/loki/api/v1/push
    # Sent as X-Scope-OrgID unless an entry carries a __tenant_id__ label
    tenant_id: ""
    # Flush a batch after this long, or once it reaches batch_size bytes
    batch_wait: 1s
    batch_size: 1048576
    # Per-request timeout
    timeout: 10s
    backoff:
      min_period: 500ms
      max_period: 5m
      # 0 retries forever
      max_retries: 10
    # Added to every stream; labels on the entry win on conflict
    external_labels:
      host: localhost
    headers: {}
    # Drop batches rejected with 429 instead of retrying them
    drop_rate_limited_batches: false
    queue:
      # Bytes of batches allowed to wait for sending
      capacity: 10485760
      # Upper bound on sending queued batches at shutdown
      drain_timeout: 15s

# =============================================================================
# METRICS (optional)
# =============================================================================
# Serves Prometheus metrics at /metrics. Omit to disable.

metrics:
  listen: 127.0.0.1:9080
"#
    .to_string()
}
