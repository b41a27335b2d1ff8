use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use chrono::{TimeZone, Utc};
use predicates::prelude::*;
use std::path::PathBuf;

use dupvol_core::container::{CompressionHint, PackedWriter};
use dupvol_core::fileset_volume::ContentInfo;
use dupvol_core::{
    hash, BlockVolumeWriter, FilesetVolumeWriter, HashAlgorithm, IndexVolumeWriter, VolumeOptions,
};

struct Fixture {
    td: TempDir,
    dblock: PathBuf,
    dindex: PathBuf,
    dlist: PathBuf,
    dblock_name: String,
    block_hashes: Vec<String>,
}

/// One block volume holding three blocks, its index and a fileset referencing it.
fn fixture() -> Fixture {
    let td = TempDir::new().unwrap();
    let opts = VolumeOptions::default();
    let alg = HashAlgorithm::Sha256;

    let tmp = td.child("dblock.tmp");
    let mut w =
        BlockVolumeWriter::create(PackedWriter::create(tmp.path()).unwrap(), opts.clone()).unwrap();
    let dblock_name = w.filename().to_string();
    let mut block_hashes = Vec::new();
    for data in [&b"first"[..], b"second", b"third"] {
        let h = alg.hash_base64(data);
        w.add_block(&h, data).unwrap();
        block_hashes.push(h);
    }
    drop(w.into_container().unwrap());
    let dblock = td.child(&dblock_name).path().to_path_buf();
    std::fs::rename(tmp.path(), &dblock).unwrap();
    let dblock_bytes = std::fs::read(&dblock).unwrap();

    let raw: Vec<u8> = block_hashes.iter().flat_map(|h| hash::from_base64(h).unwrap()).collect();
    let tmp = td.child("dindex.tmp");
    let mut w =
        IndexVolumeWriter::create(PackedWriter::create(tmp.path()).unwrap(), opts.clone()).unwrap();
    let dindex_name = w.filename().to_string();
    w.start_volume(&dblock_name).unwrap();
    for (h, data) in block_hashes.iter().zip([5u64, 6, 5]) {
        w.add_block(h, data).unwrap();
    }
    w.finish_volume(&alg.hash_base64(&dblock_bytes), dblock_bytes.len() as u64).unwrap();
    w.write_blocklist(&alg.hash_base64(&raw), &raw).unwrap();
    drop(w.into_container().unwrap());
    let dindex = td.child(&dindex_name).path().to_path_buf();
    std::fs::rename(tmp.path(), &dindex).unwrap();

    let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let tmp = td.child("dlist.tmp");
    let mut w =
        FilesetVolumeWriter::create_at(PackedWriter::create(tmp.path()).unwrap(), opts, t).unwrap();
    let dlist_name = w.filename().to_string();
    w.add_directory("/docs/", None).unwrap();
    let content = ContentInfo {
        hash: alg.hash_base64(b"firstsecondthird"),
        size: 16,
        time: t,
        blockhash: None,
        blocksize: 0,
        blocklist_hashes: vec![alg.hash_base64(&raw)],
    };
    w.add_file("/docs/a.txt", &content, None).unwrap();
    w.add_control_file("job.json", CompressionHint::Compressible, &mut &b"{}"[..]).unwrap();
    drop(w.into_container().unwrap());
    let dlist = td.child(&dlist_name).path().to_path_buf();
    std::fs::rename(tmp.path(), &dlist).unwrap();

    Fixture { td, dblock, dindex, dlist, dblock_name, block_hashes }
}

fn dupvol() -> Command {
    Command::cargo_bin("dupvol").unwrap()
}

#[test]
fn verify_accepts_matching_options() {
    let f = fixture();
    for vol in [&f.dblock, &f.dindex, &f.dlist] {
        dupvol()
            .arg("verify")
            .arg(vol)
            .assert()
            .success()
            .stdout(predicate::str::starts_with("OK duplicati-"));
    }
}

#[test]
fn verify_reports_the_mismatching_field() {
    let f = fixture();
    dupvol()
        .args(["verify", "--block-hash", "blake3"])
        .arg(&f.dblock)
        .assert()
        .failure()
        .stderr(predicate::str::contains("BlockHash"));
    dupvol()
        .args(["verify", "--blocksize", "1kb"])
        .arg(&f.dindex)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Blocksize"));
}

#[test]
fn verify_uses_the_config_file() {
    let f = fixture();
    let cfg = f.td.child("opts.json");
    cfg.write_str(r#"{"file-hash-algorithm":"sha512"}"#).unwrap();
    dupvol()
        .arg("--config")
        .arg(cfg.path())
        .arg("verify")
        .arg(&f.dlist)
        .assert()
        .failure()
        .stderr(predicate::str::contains("FileHash"));
}

#[test]
fn inspect_shows_identity_and_manifest() {
    let f = fixture();
    dupvol()
        .arg("inspect")
        .arg(&f.dlist)
        .assert()
        .success()
        .stdout(predicate::str::contains("type: dlist"))
        .stdout(predicate::str::contains("timestamp: 2024-06-01T12:00:00+00:00"))
        .stdout(predicate::str::contains(r#""BlockHash":"SHA256""#));
}

#[test]
fn list_files_prints_entries_then_control_files() {
    let f = fixture();
    dupvol()
        .arg("list-files")
        .arg(&f.dlist)
        .assert()
        .success()
        .stdout("Folder /docs/ -\nFile /docs/a.txt 16\nextra/job.json\n");
}

#[test]
fn list_blocks_of_a_block_volume() {
    let f = fixture();
    let out = dupvol().arg("list-blocks").arg(&f.dblock).assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).unwrap();
    let mut listed: Vec<&str> = stdout.lines().map(|l| l.split(' ').next().unwrap()).collect();
    listed.sort_unstable();
    let mut expected: Vec<&str> = f.block_hashes.iter().map(String::as_str).collect();
    expected.sort_unstable();
    assert_eq!(listed, expected);
}

#[test]
fn list_blocks_of_an_index_volume() {
    let f = fixture();
    dupvol()
        .arg("list-blocks")
        .arg(&f.dindex)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("volume {}\n", f.dblock_name)))
        .stdout(predicate::str::contains(format!("  {} 6\n", f.block_hashes[1])))
        .stdout(predicate::str::contains(" 96 3\n"));
}

#[test]
fn list_blocks_refuses_a_fileset() {
    let f = fixture();
    dupvol()
        .arg("list-blocks")
        .arg(&f.dlist)
        .assert()
        .failure()
        .stderr(predicate::str::contains("use list-files"));
}

#[test]
fn rename_index_rewrites_the_volume_name() {
    let f = fixture();
    let out = f.td.child("renamed.pak");
    let new_name = "duplicati-b0123456789abcdef.dblock.zst";
    dupvol()
        .arg("rename-index")
        .arg(&f.dindex)
        .arg(out.path())
        .args(["--from", &f.dblock_name, "--to", new_name])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 renamed"));
    out.assert(predicate::path::is_file());

    // Not a volume filename, so the type comes from the entries.
    dupvol()
        .arg("list-blocks")
        .arg(out.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("volume {new_name}\n")))
        .stdout(predicate::str::contains(f.dblock_name.as_str()).not());
}

#[test]
fn rename_index_rejects_a_bad_target_name() {
    let f = fixture();
    dupvol()
        .arg("rename-index")
        .arg(&f.dindex)
        .arg(f.td.child("x.pak").path())
        .args(["--from", &f.dblock_name, "--to", "not-a-volume"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not a volume filename"));
}

#[test]
fn missing_volume_fails_cleanly() {
    let td = TempDir::new().unwrap();
    dupvol()
        .arg("inspect")
        .arg(td.child("nope.zst").path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("open volume"));
}
