use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS portal (
    jid        TEXT NOT NULL,                 -- remote conversation id
    receiver   TEXT NOT NULL,                 -- jid for groups, owner for private chats
    mxid       TEXT UNIQUE,                   -- home room id, NULL until created
    name       TEXT NOT NULL DEFAULT '',
    topic      TEXT NOT NULL DEFAULT '',
    avatar     TEXT NOT NULL DEFAULT '',
    avatar_url TEXT NOT NULL DEFAULT '',
    encrypted  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (jid, receiver)
);

CREATE TABLE IF NOT EXISTS puppet (
    jid          TEXT PRIMARY KEY NOT NULL,
    avatar       TEXT NOT NULL DEFAULT '',
    avatar_url   TEXT NOT NULL DEFAULT '',
    displayname  TEXT NOT NULL DEFAULT '',
    name_quality INTEGER NOT NULL DEFAULT 0,
    custom_mxid  TEXT,
    access_token TEXT,
    next_batch   TEXT
);

CREATE INDEX IF NOT EXISTS idx_puppet_custom_mxid ON puppet(custom_mxid);

CREATE TABLE IF NOT EXISTS "user" (
    mxid                   TEXT PRIMARY KEY NOT NULL,
    jid                    TEXT UNIQUE,
    management_room        TEXT,
    last_connection        INTEGER NOT NULL DEFAULT 0,
    endpoint_id            TEXT,
    skype_token            TEXT,
    registration_token     TEXT,
    registration_token_str TEXT,
    location_host          TEXT
);

CREATE TABLE IF NOT EXISTS message (
    chat_jid      TEXT NOT NULL,
    chat_receiver TEXT NOT NULL,
    id            TEXT NOT NULL DEFAULT '',   -- canonical id once confirmed
    jid           TEXT NOT NULL,              -- client message id
    mxid          TEXT NOT NULL UNIQUE,
    sender        TEXT NOT NULL,
    timestamp     INTEGER NOT NULL,           -- unix seconds
    content       TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (chat_jid, chat_receiver, jid),
    FOREIGN KEY (chat_jid, chat_receiver) REFERENCES portal(jid, receiver)
        ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_message_chat_ts ON message(chat_jid, chat_receiver, timestamp);

CREATE TABLE IF NOT EXISTS user_portal (
    user_jid        TEXT NOT NULL,
    portal_jid      TEXT NOT NULL,
    portal_receiver TEXT NOT NULL,
    in_community    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_jid, portal_jid, portal_receiver),
    FOREIGN KEY (portal_jid, portal_receiver) REFERENCES portal(jid, receiver)
        ON DELETE CASCADE ON UPDATE CASCADE
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
