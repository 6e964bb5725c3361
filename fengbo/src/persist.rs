// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Snapshot persistence of durable broker state.
//!
//! The on-disk format is the mosquitto db format, version 2: a 15 byte
//! magic, a reserved CRC word, a version word, then a stream of chunks.
//! Every chunk is `u16 type + u32 length + payload`, big-endian. Unknown
//! chunk types are skipped so older brokers can read newer files.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use codec::QoS;
use std::convert::TryFrom;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::Path;

use crate::error::{Error, ErrorKind};
use crate::inflight::{DeliveryState, Direction};
use crate::store::StoreId;

pub const MAGIC: [u8; 15] = [
    0x00, 0xB5, 0x00, b'm', b'o', b's', b'q', b'u', b'i', b't', b't', b'o', b' ', b'd', b'b',
];

/// Current db format version.
pub const DB_VERSION: u32 = 2;

const DB_CHUNK_CFG: u16 = 1;
const DB_CHUNK_MSG_STORE: u16 = 2;
const DB_CHUNK_CLIENT_MSG: u16 = 3;
const DB_CHUNK_RETAIN: u16 = 4;
const DB_CHUNK_SUB: u16 = 5;

/// Width of store ids, recorded in the CFG chunk.
const DB_ID_SIZE: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessageRecord {
    pub id: StoreId,
    pub source_id: String,
    pub source_mid: u16,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMsgRecord {
    pub client_id: String,
    pub store_id: StoreId,
    pub mid: u16,
    pub qos: QoS,
    pub retain: bool,
    pub direction: Direction,
    pub state: DeliveryState,
    pub dup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRecord {
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
}

/// Durable broker state, as written to and read from disk.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub shutdown: bool,
    pub last_db_id: StoreId,
    pub messages: Vec<StoredMessageRecord>,
    pub client_msgs: Vec<ClientMsgRecord>,
    pub retained: Vec<StoreId>,
    pub subs: Vec<SubRecord>,
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<(), Error> {
    let len = u16::try_from(s.len()).map_err(|_err| {
        Error::from_string(
            ErrorKind::StorageError,
            format!("persist: string too long: {} bytes", s.len()),
        )
    })?;
    buf.write_u16::<BigEndian>(len)?;
    buf.write_all(s.as_bytes())?;
    Ok(())
}

fn write_chunk(out: &mut Vec<u8>, chunk_type: u16, payload: &[u8]) -> Result<(), Error> {
    out.write_u16::<BigEndian>(chunk_type)?;
    let len = u32::try_from(payload.len()).map_err(|_err| {
        Error::new(ErrorKind::StorageError, "persist: chunk payload too long")
    })?;
    out.write_u32::<BigEndian>(len)?;
    out.write_all(payload)?;
    Ok(())
}

fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    out.write_all(&MAGIC)?;
    // CRC word, reserved. Written as zero and ignored on read.
    out.write_u32::<BigEndian>(0)?;
    out.write_u32::<BigEndian>(DB_VERSION)?;

    let mut payload = Vec::new();
    payload.push(u8::from(snapshot.shutdown));
    payload.push(DB_ID_SIZE);
    payload.write_u64::<BigEndian>(snapshot.last_db_id)?;
    write_chunk(&mut out, DB_CHUNK_CFG, &payload)?;

    for msg in &snapshot.messages {
        let mut payload = Vec::new();
        payload.write_u64::<BigEndian>(msg.id)?;
        write_string(&mut payload, &msg.source_id)?;
        payload.write_u16::<BigEndian>(msg.source_mid)?;
        // Store-level mid, unused on restore.
        payload.write_u16::<BigEndian>(0)?;
        write_string(&mut payload, &msg.topic)?;
        payload.push(msg.qos as u8);
        payload.push(u8::from(msg.retain));
        let len = u32::try_from(msg.payload.len()).map_err(|_err| {
            Error::new(ErrorKind::StorageError, "persist: payload too long")
        })?;
        payload.write_u32::<BigEndian>(len)?;
        payload.write_all(&msg.payload)?;
        write_chunk(&mut out, DB_CHUNK_MSG_STORE, &payload)?;
    }

    for msg in &snapshot.client_msgs {
        let mut payload = Vec::new();
        write_string(&mut payload, &msg.client_id)?;
        payload.write_u64::<BigEndian>(msg.store_id)?;
        payload.write_u16::<BigEndian>(msg.mid)?;
        payload.push(msg.qos as u8);
        payload.push(u8::from(msg.retain));
        payload.push(msg.direction as u8);
        payload.push(msg.state as u8);
        payload.push(u8::from(msg.dup));
        write_chunk(&mut out, DB_CHUNK_CLIENT_MSG, &payload)?;
    }

    for store_id in &snapshot.retained {
        let mut payload = Vec::new();
        payload.write_u64::<BigEndian>(*store_id)?;
        write_chunk(&mut out, DB_CHUNK_RETAIN, &payload)?;
    }

    for sub in &snapshot.subs {
        let mut payload = Vec::new();
        write_string(&mut payload, &sub.client_id)?;
        write_string(&mut payload, &sub.topic)?;
        payload.push(sub.qos as u8);
        write_chunk(&mut out, DB_CHUNK_SUB, &payload)?;
    }

    Ok(out)
}

/// Write a snapshot to `path`.
///
/// The snapshot is first written to `<path>.new` and renamed over the
/// old file, so a crash mid-write leaves the previous snapshot intact.
///
/// # Errors
///
/// Returns error if the file cannot be written.
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), Error> {
    let encoded = encode_snapshot(snapshot)?;

    let mut new_path = path.as_os_str().to_owned();
    new_path.push(".new");
    let new_path = Path::new(&new_path);

    let mut file = File::create(new_path)?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    drop(file);

    fs::rename(new_path, path)?;
    Ok(())
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let len = cursor.read_u16::<BigEndian>()?;
    let mut bytes = vec![0; len as usize];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|err| {
        Error::from_string(
            ErrorKind::StorageError,
            format!("persist: invalid string in snapshot: {err}"),
        )
    })
}

fn read_qos(byte: u8) -> Result<QoS, Error> {
    QoS::try_from(byte).map_err(|_err| {
        Error::from_string(
            ErrorKind::StorageError,
            format!("persist: invalid qos byte {byte}"),
        )
    })
}

fn decode_chunk(snapshot: &mut Snapshot, chunk_type: u16, payload: &[u8]) -> Result<(), Error> {
    let mut cursor = Cursor::new(payload);
    match chunk_type {
        DB_CHUNK_CFG => {
            snapshot.shutdown = cursor.read_u8()? != 0;
            let id_size = cursor.read_u8()?;
            if id_size != DB_ID_SIZE {
                return Err(Error::from_string(
                    ErrorKind::StorageError,
                    format!("persist: unsupported db id width {id_size}"),
                ));
            }
            snapshot.last_db_id = cursor.read_u64::<BigEndian>()?;
        }
        DB_CHUNK_MSG_STORE => {
            let id = cursor.read_u64::<BigEndian>()?;
            let source_id = read_string(&mut cursor)?;
            let source_mid = cursor.read_u16::<BigEndian>()?;
            let _msg_mid = cursor.read_u16::<BigEndian>()?;
            let topic = read_string(&mut cursor)?;
            let qos = read_qos(cursor.read_u8()?)?;
            let retain = cursor.read_u8()? != 0;
            let payload_len = cursor.read_u32::<BigEndian>()?;
            let mut body = vec![0; payload_len as usize];
            cursor.read_exact(&mut body)?;
            snapshot.messages.push(StoredMessageRecord {
                id,
                source_id,
                source_mid,
                topic,
                qos,
                retain,
                payload: Bytes::from(body),
            });
        }
        DB_CHUNK_CLIENT_MSG => {
            let client_id = read_string(&mut cursor)?;
            let store_id = cursor.read_u64::<BigEndian>()?;
            let mid = cursor.read_u16::<BigEndian>()?;
            let qos = read_qos(cursor.read_u8()?)?;
            let retain = cursor.read_u8()? != 0;
            let direction = Direction::try_from(cursor.read_u8()?).map_err(|byte| {
                Error::from_string(
                    ErrorKind::StorageError,
                    format!("persist: invalid direction byte {byte}"),
                )
            })?;
            let state = DeliveryState::try_from(cursor.read_u8()?).map_err(|byte| {
                Error::from_string(
                    ErrorKind::StorageError,
                    format!("persist: invalid state byte {byte}"),
                )
            })?;
            let dup = cursor.read_u8()? != 0;
            snapshot.client_msgs.push(ClientMsgRecord {
                client_id,
                store_id,
                mid,
                qos,
                retain,
                direction,
                state,
                dup,
            });
        }
        DB_CHUNK_RETAIN => {
            snapshot.retained.push(cursor.read_u64::<BigEndian>()?);
        }
        DB_CHUNK_SUB => {
            let client_id = read_string(&mut cursor)?;
            let topic = read_string(&mut cursor)?;
            let qos = read_qos(cursor.read_u8()?)?;
            snapshot.subs.push(SubRecord {
                client_id,
                topic,
                qos,
            });
        }
        other => {
            log::info!("persist: skipping unknown chunk type {other}");
        }
    }
    Ok(())
}

/// Read a snapshot from `path`.
///
/// Returns `Ok(None)` when no file exists yet.
///
/// # Errors
///
/// Returns error if the magic does not match, the version is newer than
/// this broker supports, or a chunk is corrupted.
pub fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, Error> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if data.len() < MAGIC.len() + 8 || data[..MAGIC.len()] != MAGIC {
        return Err(Error::new(
            ErrorKind::StorageError,
            "persist: not a fengbo db file",
        ));
    }

    let mut cursor = Cursor::new(&data[MAGIC.len()..]);
    // CRC word, reserved.
    let _crc = cursor.read_u32::<BigEndian>()?;
    let version = cursor.read_u32::<BigEndian>()?;
    if version > DB_VERSION {
        return Err(Error::from_string(
            ErrorKind::StorageError,
            format!("persist: unsupported db version {version}"),
        ));
    }

    let mut snapshot = Snapshot::default();
    loop {
        let chunk_type = match cursor.read_u16::<BigEndian>() {
            Ok(chunk_type) => chunk_type,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        };
        let length = cursor.read_u32::<BigEndian>()?;
        let mut payload = vec![0; length as usize];
        cursor.read_exact(&mut payload)?;
        decode_chunk(&mut snapshot, chunk_type, &payload)?;
    }

    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::path::PathBuf;

    fn temp_db_path() -> PathBuf {
        let suffix: u32 = rand::thread_rng().gen();
        std::env::temp_dir().join(format!("fengbo-persist-test-{suffix}.db"))
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            shutdown: true,
            last_db_id: 7,
            messages: vec![StoredMessageRecord {
                id: 7,
                source_id: "c2".to_string(),
                source_mid: 3,
                topic: "s".to_string(),
                qos: QoS::AtLeastOnce,
                retain: false,
                payload: Bytes::from_static(b"m"),
            }],
            client_msgs: vec![ClientMsgRecord {
                client_id: "persist".to_string(),
                store_id: 7,
                mid: 1,
                qos: QoS::AtLeastOnce,
                retain: false,
                direction: Direction::Outgoing,
                state: DeliveryState::WaitPuback,
                dup: false,
            }],
            retained: vec![7],
            subs: vec![SubRecord {
                client_id: "persist".to_string(),
                topic: "s".to_string(),
                qos: QoS::AtLeastOnce,
            }],
        }
    }

    #[test]
    fn test_round_trip() {
        let path = temp_db_path();
        let snapshot = sample_snapshot();
        write_snapshot(&path, &snapshot).unwrap();

        let restored = read_snapshot(&path).unwrap().unwrap();
        assert!(restored.shutdown);
        assert_eq!(restored.last_db_id, 7);
        assert_eq!(restored.messages, snapshot.messages);
        assert_eq!(restored.client_msgs, snapshot.client_msgs);
        assert_eq!(restored.retained, snapshot.retained);
        assert_eq!(restored.subs, snapshot.subs);

        let _ret = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_empty_start() {
        let path = temp_db_path();
        assert!(read_snapshot(&path).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_refused() {
        let path = temp_db_path();
        fs::write(&path, b"not a database at all").unwrap();
        let err = read_snapshot(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageError);
        let _ret = fs::remove_file(&path);
    }

    #[test]
    fn test_newer_version_refused() {
        let path = temp_db_path();
        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&(DB_VERSION + 1).to_be_bytes());
        fs::write(&path, &data).unwrap();
        assert!(read_snapshot(&path).is_err());
        let _ret = fs::remove_file(&path);
    }

    #[test]
    fn test_unknown_chunk_skipped() {
        let path = temp_db_path();
        let mut data = encode_snapshot(&sample_snapshot()).unwrap();
        // Append an unknown chunk type with a small payload.
        data.extend_from_slice(&99u16.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[0xab, 0xcd]);
        fs::write(&path, &data).unwrap();

        let restored = read_snapshot(&path).unwrap().unwrap();
        assert_eq!(restored.messages.len(), 1);
        let _ret = fs::remove_file(&path);
    }

    #[test]
    fn test_header_layout() {
        let data = encode_snapshot(&Snapshot::default()).unwrap();
        assert_eq!(&data[..15], &MAGIC);
        // Reserved CRC is zero.
        assert_eq!(&data[15..19], &[0, 0, 0, 0]);
        assert_eq!(&data[19..23], &DB_VERSION.to_be_bytes());
        // First chunk is CFG.
        assert_eq!(&data[23..25], &DB_CHUNK_CFG.to_be_bytes());
    }
}
