use std::sync::Arc;

use calicodb::env::MemEnv;
use calicodb::{Database, Options};
use tempfile::TempDir;

fn mem_options(env: &MemEnv, page_size: usize) -> Options {
    Options {
        page_size,
        env: Some(Arc::new(env.clone())),
        ..Options::default()
    }
}

#[test]
fn committed_records_survive_a_crash() {
    let env = MemEnv::new();
    {
        let db = Database::open("/test.db", mem_options(&env, 4096)).unwrap();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        db.commit().unwrap();
        db.put(b"c", b"3").unwrap();
        // No commit for "c"; the handle just goes away.
    }
    // Crash: whatever was not fsynced is gone.
    env.drop_after_last_sync();

    let db = Database::open("/test.db", mem_options(&env, 4096)).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(b"c").unwrap(), None);

    let mut cursor = db.cursor();
    let mut entries = Vec::new();
    let mut entry = cursor.seek_first().unwrap();
    while let Some(pair) = entry {
        entries.push(pair);
        entry = cursor.next().unwrap();
    }
    assert_eq!(
        entries,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ]
    );
}

#[test]
fn repeated_commits_accumulate() {
    let env = MemEnv::new();
    {
        let db = Database::open("/test.db", mem_options(&env, 512)).unwrap();
        for round in 0..5u32 {
            for i in 0..40u32 {
                let key = format!("r{round}-{i:03}");
                db.put(key.as_bytes(), format!("v{round}").as_bytes()).unwrap();
            }
            db.commit().unwrap();
        }
    }
    env.drop_after_last_sync();

    let db = Database::open("/test.db", mem_options(&env, 512)).unwrap();
    assert_eq!(db.stats().unwrap().record_count, 200);
    for round in 0..5u32 {
        for i in 0..40u32 {
            let key = format!("r{round}-{i:03}");
            assert_eq!(
                db.get(key.as_bytes()).unwrap(),
                Some(format!("v{round}").into_bytes()),
                "missing {key}"
            );
        }
    }
}

#[test]
fn disk_backend_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let options = Options {
        page_size: 4096,
        ..Options::default()
    };
    {
        let db = Database::open(&path, options.clone()).unwrap();
        db.put(b"k", b"v").unwrap();
        db.commit().unwrap();
    }
    let db = Database::open(&path, options).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn uncommitted_evictions_are_rolled_back() {
    let env = MemEnv::new();
    {
        let db = Database::open("/test.db", mem_options(&env, 512)).unwrap();
        for i in 0..10u32 {
            db.put(format!("base-{i}").as_bytes(), b"committed").unwrap();
        }
        db.commit().unwrap();

        // A tiny cache forces dirty evictions, so uncommitted pages reach
        // the data file. None of it may survive reopen.
        drop(db);
    }
    {
        let options = Options {
            page_size: 512,
            cache_size: 16 * 512,
            env: Some(Arc::new(env.clone())),
            ..Options::default()
        };
        let db = Database::open("/test.db", options).unwrap();
        for i in 0..400u32 {
            let key = format!("evicted-{i:04}");
            db.put(key.as_bytes(), &[0xEE; 80]).unwrap();
        }
        // Crash without commit; eviction already wrote some of these pages.
    }
    let db = Database::open("/test.db", mem_options(&env, 512)).unwrap();
    assert_eq!(db.stats().unwrap().record_count, 10);
    for i in 0..10u32 {
        assert_eq!(
            db.get(format!("base-{i}").as_bytes()).unwrap(),
            Some(b"committed".to_vec())
        );
    }
    assert_eq!(db.get(b"evicted-0000").unwrap(), None);
}
