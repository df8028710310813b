use ferrotree::{Error, DB};
use rand::Rng;
use tempfile::tempdir;

fn open_db() -> (tempfile::TempDir, DB) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    let db = DB::open(&path).unwrap();
    (dir, db)
}

#[test]
fn put_and_get_round_trips() {
    let (_dir, db) = open_db();
    db.update(|tx| {
        let b = tx.create_bucket(b"widgets")?;
        b.put(b"hello", b"hello world")
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        assert_eq!(b.get(b"hello"), Some(b"hello world".to_vec()));
        assert_eq!(b.get(b"missing"), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn second_writable_transaction_blocks_until_first_releases() {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    let (_dir, db) = open_db();
    let tx1 = db.begin(true).unwrap();

    let db2 = db.clone();
    let (about_to_block, blocked) = mpsc::channel();
    let handle = thread::spawn(move || {
        about_to_block.send(()).unwrap();
        let tx2 = db2.begin(true).unwrap();
        tx2.rollback().unwrap();
    });

    blocked.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(!handle.is_finished(), "second writer should still be blocked on the first");

    tx1.rollback().unwrap();
    handle.join().unwrap();
}

#[test]
fn putting_a_value_over_a_bucket_is_rejected() {
    let (_dir, db) = open_db();
    let result = db.update(|tx| {
        let root = tx.create_bucket(b"widgets")?;
        root.create_bucket(b"nested")?;
        root.put(b"nested", b"oops")
    });
    assert!(matches!(result, Err(Error::IncompatibleValue)));
}

#[test]
fn creating_a_bucket_twice_is_rejected() {
    let (_dir, db) = open_db();
    let result = db.update(|tx| {
        tx.create_bucket(b"widgets")?;
        tx.create_bucket(b"widgets")
    });
    assert!(matches!(result, Err(Error::BucketExists)));
}

#[test]
fn nested_bucket_survives_commit() {
    let (_dir, db) = open_db();
    db.update(|tx| {
        let root = tx.create_bucket(b"widgets")?;
        let child = root.create_bucket(b"parts")?;
        child.put(b"bolt", b"m8")
    })
    .unwrap();

    db.view(|tx| {
        let root = tx.bucket(b"widgets").unwrap();
        let child = root.bucket(b"parts").unwrap();
        assert_eq!(child.get(b"bolt"), Some(b"m8".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn deleting_a_bucket_removes_its_keys() {
    let (_dir, db) = open_db();
    db.update(|tx| {
        let root = tx.create_bucket(b"widgets")?;
        let child = root.create_bucket(b"parts")?;
        child.put(b"bolt", b"m8")?;
        root.delete_bucket(b"parts")
    })
    .unwrap();

    db.view(|tx| {
        let root = tx.bucket(b"widgets").unwrap();
        assert!(root.bucket(b"parts").is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn rollback_discards_uncommitted_writes() {
    let (_dir, db) = open_db();
    db.update(|tx| tx.create_bucket(b"widgets").map(|_| ())).unwrap();

    let tx = db.begin(true).unwrap();
    let b = tx.bucket(b"widgets").unwrap();
    b.put(b"temp", b"value").unwrap();
    tx.rollback().unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        assert_eq!(b.get(b"temp"), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn ten_thousand_keys_split_across_many_pages() {
    let (_dir, db) = open_db();
    db.update(|tx| {
        let b = tx.create_bucket(b"big")?;
        for i in 0..10_000u32 {
            let key = format!("key-{:06}", i);
            b.put(key.as_bytes(), &i.to_le_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"big").unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let i: u32 = rng.gen_range(0..10_000);
            let key = format!("key-{:06}", i);
            assert_eq!(b.get(key.as_bytes()), Some(i.to_le_bytes().to_vec()));
        }
        assert_eq!(b.get(b"key-009999"), Some(9999u32.to_le_bytes().to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_iterates_in_sorted_order() {
    let (_dir, db) = open_db();
    db.update(|tx| {
        let b = tx.create_bucket(b"sorted")?;
        for key in ["banana", "apple", "cherry"] {
            b.put(key.as_bytes(), b"")?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"sorted").unwrap();
        let mut c = b.cursor();
        let keys: Vec<Vec<u8>> = c.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn transaction_check_finds_no_corruption_after_heavy_churn() {
    let (_dir, db) = open_db();
    db.update(|tx| {
        let b = tx.create_bucket(b"churn")?;
        for i in 0..2_000u32 {
            b.put(format!("k{}", i).as_bytes(), b"v")?;
        }
        for i in 0..1_000u32 {
            b.delete(format!("k{}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| tx.check()).unwrap();
}

#[test]
fn value_larger_than_a_page_survives_commit() {
    let (_dir, db) = open_db();
    let big = vec![0x5au8; 16 * 1024];
    db.update(|tx| {
        let b = tx.create_bucket(b"blobs")?;
        b.put(b"huge", &big)
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"blobs").unwrap();
        assert_eq!(b.get(b"huge"), Some(big.clone()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn root_bucket_is_reachable_without_a_name() {
    let (_dir, db) = open_db();
    db.view(|tx| {
        assert!(tx.root_bucket().get(b"foo").is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn reader_snapshot_is_isolated_from_a_later_writer() {
    let (_dir, db) = open_db();
    db.update(|tx| tx.create_bucket(b"widgets").map(|_| ())).unwrap();

    let reader = db.begin(false).unwrap();

    db.update(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        b.put(b"foo", b"bar")
    })
    .unwrap();

    // the reader's view was captured before the write committed
    let b = reader.bucket(b"widgets").unwrap();
    assert_eq!(b.get(b"foo"), None);
    reader.rollback().unwrap();

    // a reader begun afterwards sees the committed write
    db.view(|tx| {
        let b = tx.bucket(b"widgets").unwrap();
        assert_eq!(b.get(b"foo"), Some(b"bar".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn sub_bucket_survives_growing_past_the_inline_threshold() {
    let (_dir, db) = open_db();
    db.update(|tx| {
        let root = tx.create_bucket(b"widgets")?;
        let child = root.create_bucket(b"small")?;
        child.put(b"a", b"b")
    })
    .unwrap();

    db.view(|tx| {
        let root = tx.bucket(b"widgets").unwrap();
        let child = root.bucket(b"small").unwrap();
        assert_eq!(child.get(b"a"), Some(b"b".to_vec()));
        Ok(())
    })
    .unwrap();

    // enough entries to force the sub-bucket's leaf past the 1024-byte /
    // quarter-page inline ceiling, so it must spill to a standalone page
    db.update(|tx| {
        let root = tx.bucket(b"widgets").unwrap();
        let child = root.bucket(b"small").unwrap();
        for i in 0..200u32 {
            child.put(format!("key-{:04}", i).as_bytes(), &[0x42u8; 32])?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let root = tx.bucket(b"widgets").unwrap();
        let child = root.bucket(b"small").unwrap();
        assert_eq!(child.get(b"a"), Some(b"b".to_vec()));
        assert_eq!(child.get(b"key-0199"), Some(vec![0x42u8; 32]));
        Ok(())
    })
    .unwrap();
}
