/// SQL DDL for the crew-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 2;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    context_type TEXT NOT NULL,
    context_id TEXT NOT NULL,
    agent_role TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active'
        CHECK (status IN ('active', 'completed', 'failed')),
    failure_reason TEXT,
    sandbox_root TEXT NOT NULL,
    alternate_root TEXT,
    read_only INTEGER NOT NULL DEFAULT 0,
    group_id TEXT REFERENCES fan_in_groups(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    turn_index INTEGER NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'streaming'
        CHECK (status IN ('streaming', 'completed', 'failed')),
    token_count INTEGER NOT NULL DEFAULT 0,
    next_ordinal INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    UNIQUE (session_id, turn_index)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    turn_id TEXT NOT NULL REFERENCES turns(id),
    ordinal INTEGER NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS thoughts (
    id TEXT PRIMARY KEY,
    turn_id TEXT NOT NULL REFERENCES turns(id),
    ordinal INTEGER NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tool_invocations (
    id TEXT PRIMARY KEY,
    turn_id TEXT NOT NULL REFERENCES turns(id),
    ordinal INTEGER NOT NULL,
    call_id TEXT NOT NULL,
    name TEXT NOT NULL,
    rationale TEXT,
    input TEXT NOT NULL,
    output TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'success', 'failed')),
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS questions (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    turn_id TEXT NOT NULL REFERENCES turns(id),
    kind TEXT NOT NULL
        CHECK (kind IN ('single_select', 'multi_select', 'ranked', 'free_text')),
    prompt TEXT NOT NULL,
    options TEXT NOT NULL DEFAULT '[]',
    answer TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'answered', 'skipped')),
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    CHECK (status != 'answered' OR answer IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS notes (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    turn_id TEXT REFERENCES turns(id),
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS todos (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    content TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fan_in_groups (
    id TEXT PRIMARY KEY,
    expected_count INTEGER NOT NULL CHECK (expected_count > 0),
    triggered_at TEXT,
    last_trigger_error TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS persona_completions (
    group_id TEXT NOT NULL REFERENCES fan_in_groups(id),
    member_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    PRIMARY KEY (group_id, member_id)
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_context ON sessions(context_type, context_id);
CREATE INDEX IF NOT EXISTS idx_messages_turn ON messages(turn_id, ordinal);
CREATE INDEX IF NOT EXISTS idx_thoughts_turn ON thoughts(turn_id, ordinal);
CREATE INDEX IF NOT EXISTS idx_invocations_turn ON tool_invocations(turn_id, ordinal);
CREATE UNIQUE INDEX IF NOT EXISTS idx_invocations_one_pending
    ON tool_invocations(turn_id) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_questions_session ON questions(session_id, status);
CREATE INDEX IF NOT EXISTS idx_notes_session ON notes(session_id);
CREATE INDEX IF NOT EXISTS idx_todos_session ON todos(session_id);

CREATE TRIGGER IF NOT EXISTS turns_immutable_once_ended
BEFORE UPDATE ON turns
WHEN OLD.status != 'streaming'
BEGIN
    SELECT RAISE(ABORT, 'turn is no longer streaming');
END;

CREATE TRIGGER IF NOT EXISTS questions_resolve_once
BEFORE UPDATE ON questions
WHEN OLD.status != 'pending'
BEGIN
    SELECT RAISE(ABORT, 'question already resolved');
END;

CREATE TRIGGER IF NOT EXISTS questions_never_deleted
BEFORE DELETE ON questions
BEGIN
    SELECT RAISE(ABORT, 'questions are never deleted');
END;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
