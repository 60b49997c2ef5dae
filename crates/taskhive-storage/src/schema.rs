//! Logical schema for the SQL backends
//!
//! Both scripts are idempotent (`IF NOT EXISTS` throughout) so applying
//! them on open is safe. CHECK constraints mirror the field validation in
//! taskhive-core as a second line of defense against out-of-band writes.

/// Complete SQLite schema.
pub const SQLITE_SCHEMA: &str = r"
    -- Issues
    CREATE TABLE IF NOT EXISTS issues (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL CHECK(length(title) > 0 AND length(title) <= 500),
        description TEXT NOT NULL DEFAULT '',
        design TEXT NOT NULL DEFAULT '',
        acceptance_criteria TEXT NOT NULL DEFAULT '',
        notes TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'open'
            CHECK(status IN ('open', 'in_progress', 'blocked', 'closed')),
        priority INTEGER NOT NULL DEFAULT 2 CHECK(priority >= 0 AND priority <= 4),
        issue_type TEXT NOT NULL DEFAULT 'task'
            CHECK(issue_type IN ('bug', 'feature', 'task', 'epic', 'chore')),
        assignee TEXT,
        estimated_minutes INTEGER CHECK(estimated_minutes IS NULL OR estimated_minutes >= 0),
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL,
        closed_at DATETIME,
        approved_at DATETIME,
        approved_by TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
    CREATE INDEX IF NOT EXISTS idx_issues_priority ON issues(priority);
    CREATE INDEX IF NOT EXISTS idx_issues_issue_type ON issues(issue_type);
    CREATE INDEX IF NOT EXISTS idx_issues_assignee ON issues(assignee) WHERE assignee IS NOT NULL;
    CREATE INDEX IF NOT EXISTS idx_issues_created_at ON issues(created_at);

    -- Ready-work composite index
    CREATE INDEX IF NOT EXISTS idx_issues_ready
        ON issues(status, priority, created_at)
        WHERE status IN ('open', 'in_progress');

    -- Dependencies
    CREATE TABLE IF NOT EXISTS dependencies (
        issue_id TEXT NOT NULL,
        depends_on_id TEXT NOT NULL,
        type TEXT NOT NULL DEFAULT 'blocks'
            CHECK(type IN ('blocks', 'related', 'parent-child', 'discovered-from')),
        created_at DATETIME NOT NULL,
        PRIMARY KEY (issue_id, depends_on_id),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE,
        FOREIGN KEY (depends_on_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_dependencies_issue_id ON dependencies(issue_id);
    CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on_id ON dependencies(depends_on_id);
    CREATE INDEX IF NOT EXISTS idx_dependencies_type ON dependencies(type);

    -- Labels
    CREATE TABLE IF NOT EXISTS labels (
        issue_id TEXT NOT NULL,
        label TEXT NOT NULL CHECK(length(label) > 0 AND length(label) <= 255),
        PRIMARY KEY (issue_id, label),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_labels_label ON labels(label);

    -- Audit events
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        issue_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        actor TEXT NOT NULL DEFAULT '',
        old_value TEXT,
        new_value TEXT,
        comment TEXT,
        created_at DATETIME NOT NULL,
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_events_issue ON events(issue_id);
    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
    CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);

    -- Executor instances
    CREATE TABLE IF NOT EXISTS executor_instances (
        instance_id TEXT PRIMARY KEY,
        hostname TEXT NOT NULL CHECK(length(hostname) > 0),
        pid INTEGER NOT NULL CHECK(pid > 0),
        status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running', 'stopped')),
        started_at DATETIME NOT NULL,
        last_heartbeat DATETIME NOT NULL,
        version TEXT NOT NULL DEFAULT '',
        metadata TEXT NOT NULL DEFAULT '{}',
        self_healing_mode TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_executor_instances_status ON executor_instances(status);
    CREATE INDEX IF NOT EXISTS idx_executor_instances_heartbeat
        ON executor_instances(last_heartbeat);

    -- Execution state: one row per claimed issue
    CREATE TABLE IF NOT EXISTS issue_execution_state (
        issue_id TEXT PRIMARY KEY,
        executor_instance_id TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'claimed'
            CHECK(state IN ('claimed', 'assessing', 'executing', 'analyzing',
                            'gates', 'committing', 'completed', 'failed')),
        checkpoint TEXT NOT NULL DEFAULT '{}',
        started_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL,
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE,
        FOREIGN KEY (executor_instance_id) REFERENCES executor_instances(instance_id)
    );
    CREATE INDEX IF NOT EXISTS idx_execution_state_executor
        ON issue_execution_state(executor_instance_id);

    -- Execution history: append-only, one row per attempt
    CREATE TABLE IF NOT EXISTS execution_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        issue_id TEXT NOT NULL,
        attempt_number INTEGER NOT NULL CHECK(attempt_number > 0),
        started_at DATETIME NOT NULL,
        completed_at DATETIME,
        success INTEGER,
        exit_code INTEGER,
        summary TEXT NOT NULL DEFAULT '',
        output_sample TEXT NOT NULL DEFAULT '',
        error_sample TEXT NOT NULL DEFAULT '',
        UNIQUE (issue_id, attempt_number),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_execution_history_issue ON execution_history(issue_id);

    -- Agent event stream
    CREATE TABLE IF NOT EXISTS agent_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type TEXT NOT NULL,
        timestamp DATETIME NOT NULL,
        issue_id TEXT NOT NULL,
        executor_id TEXT,
        agent_id TEXT,
        severity TEXT NOT NULL CHECK(severity IN ('info', 'warning', 'error', 'critical')),
        message TEXT NOT NULL DEFAULT '',
        data_json TEXT NOT NULL DEFAULT '{}',
        source_line INTEGER,
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_agent_events_issue ON agent_events(issue_id);
    CREATE INDEX IF NOT EXISTS idx_agent_events_type ON agent_events(event_type);
    CREATE INDEX IF NOT EXISTS idx_agent_events_severity ON agent_events(severity);
    CREATE INDEX IF NOT EXISTS idx_agent_events_timestamp ON agent_events(timestamp);

    -- Per-prefix monotonic ID counter
    CREATE TABLE IF NOT EXISTS id_counters (
        prefix TEXT PRIMARY KEY,
        last_value INTEGER NOT NULL CHECK(last_value > 0)
    );

    -- Runtime config
    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    -- Readiness view: open issues with no unresolved blocker
    CREATE VIEW IF NOT EXISTS ready_issues AS
    SELECT i.*
    FROM issues i
    WHERE i.status = 'open'
      AND NOT EXISTS (
          SELECT 1
          FROM dependencies d
          JOIN issues b ON b.id = d.depends_on_id
          WHERE d.issue_id = i.id
            AND d.type = 'blocks'
            AND b.status IN ('open', 'in_progress', 'blocked')
      );

    -- Blocker aggregation view
    CREATE VIEW IF NOT EXISTS blocked_issues AS
    SELECT i.id AS issue_id,
           COUNT(b.id) AS blocker_count,
           GROUP_CONCAT(b.id) AS blocker_ids
    FROM issues i
    JOIN dependencies d ON d.issue_id = i.id AND d.type = 'blocks'
    JOIN issues b ON b.id = d.depends_on_id
        AND b.status IN ('open', 'in_progress', 'blocked')
    WHERE i.status IN ('open', 'in_progress', 'blocked')
    GROUP BY i.id;
";

/// Complete PostgreSQL schema.
pub const POSTGRES_SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS issues (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL CHECK(length(title) > 0 AND length(title) <= 500),
        description TEXT NOT NULL DEFAULT '',
        design TEXT NOT NULL DEFAULT '',
        acceptance_criteria TEXT NOT NULL DEFAULT '',
        notes TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'open'
            CHECK(status IN ('open', 'in_progress', 'blocked', 'closed')),
        priority BIGINT NOT NULL DEFAULT 2 CHECK(priority >= 0 AND priority <= 4),
        issue_type TEXT NOT NULL DEFAULT 'task'
            CHECK(issue_type IN ('bug', 'feature', 'task', 'epic', 'chore')),
        assignee TEXT,
        estimated_minutes BIGINT CHECK(estimated_minutes IS NULL OR estimated_minutes >= 0),
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        closed_at TIMESTAMPTZ,
        approved_at TIMESTAMPTZ,
        approved_by TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
    CREATE INDEX IF NOT EXISTS idx_issues_priority ON issues(priority);
    CREATE INDEX IF NOT EXISTS idx_issues_issue_type ON issues(issue_type);
    CREATE INDEX IF NOT EXISTS idx_issues_created_at ON issues(created_at);
    CREATE INDEX IF NOT EXISTS idx_issues_ready
        ON issues(status, priority, created_at)
        WHERE status IN ('open', 'in_progress');

    CREATE TABLE IF NOT EXISTS dependencies (
        issue_id TEXT NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
        depends_on_id TEXT NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
        type TEXT NOT NULL DEFAULT 'blocks'
            CHECK(type IN ('blocks', 'related', 'parent-child', 'discovered-from')),
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (issue_id, depends_on_id)
    );
    CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on_id ON dependencies(depends_on_id);
    CREATE INDEX IF NOT EXISTS idx_dependencies_type ON dependencies(type);

    CREATE TABLE IF NOT EXISTS labels (
        issue_id TEXT NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
        label TEXT NOT NULL CHECK(length(label) > 0 AND length(label) <= 255),
        PRIMARY KEY (issue_id, label)
    );
    CREATE INDEX IF NOT EXISTS idx_labels_label ON labels(label);

    CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        issue_id TEXT NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
        event_type TEXT NOT NULL,
        actor TEXT NOT NULL DEFAULT '',
        old_value TEXT,
        new_value TEXT,
        comment TEXT,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_issue ON events(issue_id);
    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
    CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);

    CREATE TABLE IF NOT EXISTS executor_instances (
        instance_id TEXT PRIMARY KEY,
        hostname TEXT NOT NULL CHECK(length(hostname) > 0),
        pid BIGINT NOT NULL CHECK(pid > 0),
        status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running', 'stopped')),
        started_at TIMESTAMPTZ NOT NULL,
        last_heartbeat TIMESTAMPTZ NOT NULL,
        version TEXT NOT NULL DEFAULT '',
        metadata TEXT NOT NULL DEFAULT '{}',
        self_healing_mode TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_executor_instances_status ON executor_instances(status);
    CREATE INDEX IF NOT EXISTS idx_executor_instances_heartbeat
        ON executor_instances(last_heartbeat);

    CREATE TABLE IF NOT EXISTS issue_execution_state (
        issue_id TEXT PRIMARY KEY REFERENCES issues(id) ON DELETE CASCADE,
        executor_instance_id TEXT NOT NULL REFERENCES executor_instances(instance_id),
        state TEXT NOT NULL DEFAULT 'claimed'
            CHECK(state IN ('claimed', 'assessing', 'executing', 'analyzing',
                            'gates', 'committing', 'completed', 'failed')),
        checkpoint TEXT NOT NULL DEFAULT '{}',
        started_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_execution_state_executor
        ON issue_execution_state(executor_instance_id);

    CREATE TABLE IF NOT EXISTS execution_history (
        id BIGSERIAL PRIMARY KEY,
        issue_id TEXT NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
        attempt_number BIGINT NOT NULL CHECK(attempt_number > 0),
        started_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        success BOOLEAN,
        exit_code BIGINT,
        summary TEXT NOT NULL DEFAULT '',
        output_sample TEXT NOT NULL DEFAULT '',
        error_sample TEXT NOT NULL DEFAULT '',
        UNIQUE (issue_id, attempt_number)
    );
    CREATE INDEX IF NOT EXISTS idx_execution_history_issue ON execution_history(issue_id);

    CREATE TABLE IF NOT EXISTS agent_events (
        id BIGSERIAL PRIMARY KEY,
        event_type TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        issue_id TEXT NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
        executor_id TEXT,
        agent_id TEXT,
        severity TEXT NOT NULL CHECK(severity IN ('info', 'warning', 'error', 'critical')),
        message TEXT NOT NULL DEFAULT '',
        data_json TEXT NOT NULL DEFAULT '{}',
        source_line BIGINT
    );
    CREATE INDEX IF NOT EXISTS idx_agent_events_issue ON agent_events(issue_id);
    CREATE INDEX IF NOT EXISTS idx_agent_events_severity ON agent_events(severity);
    CREATE INDEX IF NOT EXISTS idx_agent_events_timestamp ON agent_events(timestamp);

    CREATE TABLE IF NOT EXISTS id_counters (
        prefix TEXT PRIMARY KEY,
        last_value BIGINT NOT NULL CHECK(last_value > 0)
    );

    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE OR REPLACE VIEW ready_issues AS
    SELECT i.*
    FROM issues i
    WHERE i.status = 'open'
      AND NOT EXISTS (
          SELECT 1
          FROM dependencies d
          JOIN issues b ON b.id = d.depends_on_id
          WHERE d.issue_id = i.id
            AND d.type = 'blocks'
            AND b.status IN ('open', 'in_progress', 'blocked')
      );

    CREATE OR REPLACE VIEW blocked_issues AS
    SELECT i.id AS issue_id,
           COUNT(b.id) AS blocker_count,
           STRING_AGG(b.id, ',') AS blocker_ids
    FROM issues i
    JOIN dependencies d ON d.issue_id = i.id AND d.type = 'blocks'
    JOIN issues b ON b.id = d.depends_on_id
        AND b.status IN ('open', 'in_progress', 'blocked')
    WHERE i.status IN ('open', 'in_progress', 'blocked')
    GROUP BY i.id;
";
