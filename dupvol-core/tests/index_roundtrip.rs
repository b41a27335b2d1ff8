use std::io::Read;

use dupvol_core::container::{MemoryContainer, VolumeContainer};
use dupvol_core::hash;
use dupvol_core::index_volume::{IndexVolumeReader, IndexVolumeWriter};
use dupvol_core::{BlockVolumeWriter, HashAlgorithm, VolumeError, VolumeOptions};

fn options() -> VolumeOptions {
    VolumeOptions { blocksize: 4, ..VolumeOptions::default() }
}

/// A block volume with two 4-byte blocks, plus its filename, hash and size.
fn block_volume() -> (String, Vec<(String, u64)>, String, u64) {
    let mut w = BlockVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
    let name = w.filename().to_string();
    let mut blocks = Vec::new();
    for data in [b"AAAA", b"BBBB"] {
        let h = HashAlgorithm::Sha256.hash_base64(data);
        w.add_block(&h, data).unwrap();
        blocks.push((h, 4));
    }
    let c = w.into_container().unwrap();
    // A stand-in for hashing the uploaded file.
    let vol_hash = HashAlgorithm::Sha256.hash_base64(name.as_bytes());
    (name, blocks, vol_hash, c.size())
}

fn index_of(volumes: &[(String, Vec<(String, u64)>, String, u64)]) -> MemoryContainer {
    let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
    for (name, blocks, vol_hash, vol_size) in volumes {
        w.start_volume(name).unwrap();
        for (h, s) in blocks {
            w.add_block(h, *s).unwrap();
        }
        w.finish_volume(vol_hash, *vol_size).unwrap();
    }
    w.into_container().unwrap()
}

#[test]
fn index_round_trip_keeps_order_and_volume_props() {
    let (name, blocks, vol_hash, vol_size) = block_volume();
    let c = index_of(&[(name.clone(), blocks.clone(), vol_hash.clone(), vol_size)]);

    let r = IndexVolumeReader::open(c, &options()).unwrap();
    let mut volumes: Vec<_> = r.volumes().unwrap().collect();
    assert_eq!(volumes.len(), 1);
    let vol = &mut volumes[0];
    assert_eq!(vol.filename(), name);
    let got: Vec<_> = vol.blocks().unwrap().collect::<Result<_, _>>().unwrap();
    assert_eq!(got, blocks);
    assert_eq!(vol.volume_hash().unwrap(), vol_hash);
    assert_eq!(vol.volume_size().unwrap(), vol_size);
}

#[test]
fn volume_props_after_a_partial_read() {
    let many: Vec<(String, u64)> =
        (0..50u64).map(|i| (HashAlgorithm::Sha256.hash_base64(&i.to_le_bytes()), i)).collect();
    let c = index_of(&[("duplicati-b0a.dblock.zst".into(), many, "VH".into(), 777)]);
    let r = IndexVolumeReader::open(c, &options()).unwrap();
    let mut vol = r.volumes().unwrap().next().unwrap();

    {
        let mut blocks = vol.blocks().unwrap();
        assert_eq!(blocks.next().unwrap().unwrap().1, 0);
        assert_eq!(blocks.next().unwrap().unwrap().1, 1);
    }
    assert_eq!(vol.volume_hash().unwrap(), "VH");
    // Cached: the entry is not read again.
    assert_eq!(vol.volume_size().unwrap(), 777);
    assert_eq!(vol.volume_hash().unwrap(), "VH");
    assert!(matches!(vol.blocks(), Err(VolumeError::Sequence(_))));
}

#[test]
fn volume_props_before_any_block() {
    let (name, blocks, vol_hash, vol_size) = block_volume();
    let c = index_of(&[(name, blocks, vol_hash.clone(), vol_size)]);
    let r = IndexVolumeReader::open(c, &options()).unwrap();
    let mut vol = r.volumes().unwrap().next().unwrap();
    assert_eq!(vol.volume_size().unwrap(), vol_size);
    assert_eq!(vol.volume_hash().unwrap(), vol_hash);
}

#[test]
fn blocklists_are_stored_under_list_and_verified() {
    let alg = HashAlgorithm::Sha256;
    let raw: Vec<u8> = (0u8..3)
        .flat_map(|i| hash::from_base64(&alg.hash_base64(&[i])).unwrap())
        .collect();
    let bl_hash = alg.hash_base64(&raw);

    let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
    w.write_blocklist(&bl_hash, &raw).unwrap();
    assert!(matches!(
        w.write_blocklist(&bl_hash, &raw[..40]),
        Err(VolumeError::MalformedBlocklist { len: 40, .. })
    ));
    let c = w.into_container().unwrap();
    assert!(c.get(&format!("list/{}", hash::base64_plain_to_url(&bl_hash))).is_some());

    let r = IndexVolumeReader::open(c, &options()).unwrap();
    let lists: Vec<_> = r.block_lists().unwrap().collect();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].length(), 96);
    let hashes: Vec<_> = lists[0].hashes().unwrap().collect::<Result<_, _>>().unwrap();
    let expected: Vec<_> = (0u8..3).map(|i| alg.hash_base64(&[i])).collect();
    assert_eq!(hashes, expected);
}

#[test]
fn tampered_blocklist_fails_verification() {
    let alg = HashAlgorithm::Sha256;
    let raw = vec![9u8; 64];
    let bl_hash = alg.hash_base64(&raw);
    let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
    w.write_blocklist(&bl_hash, &raw).unwrap();
    let mut c = w.into_container().unwrap();
    c.insert(&format!("list/{}", hash::base64_plain_to_url(&bl_hash)), vec![8u8; 64]);

    let r = IndexVolumeReader::open(c, &options()).unwrap();
    let list = r.block_lists().unwrap().next().unwrap();
    let res: Result<Vec<_>, _> = list.hashes().unwrap().collect();
    assert!(matches!(res, Err(VolumeError::BlocklistHashMismatch { .. })));
}

#[test]
fn copy_from_renames_volumes_and_keeps_everything_else() {
    let (name_a, blocks_a, hash_a, size_a) = block_volume();
    let (name_b, blocks_b, hash_b, size_b) = block_volume();
    let alg = HashAlgorithm::Sha256;
    let raw = vec![5u8; 32 * 4];
    let bl_hash = alg.hash_base64(&raw);

    let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
    for (n, bs, h, s) in
        [(&name_a, &blocks_a, &hash_a, size_a), (&name_b, &blocks_b, &hash_b, size_b)]
    {
        w.start_volume(n).unwrap();
        for (bh, sz) in bs {
            w.add_block(bh, *sz).unwrap();
        }
        w.finish_volume(h, s).unwrap();
    }
    w.write_blocklist(&bl_hash, &raw).unwrap();
    let source = IndexVolumeReader::open(w.into_container().unwrap(), &options()).unwrap();

    let mut copy = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
    copy.copy_from(&source, |old| old.replace("duplicati-", "repacked-")).unwrap();
    assert_eq!(copy.volumes(), 2);
    assert_eq!(copy.blocklists(), 1);
    let r = IndexVolumeReader::open(copy.into_container().unwrap(), &options()).unwrap();

    let mut seen = Vec::new();
    for mut vol in r.volumes().unwrap() {
        let blocks: Vec<_> = vol.blocks().unwrap().collect::<Result<_, _>>().unwrap();
        let h = vol.volume_hash().unwrap().to_string();
        let s = vol.volume_size().unwrap();
        seen.push((vol.filename().to_string(), blocks, h, s));
    }
    assert_eq!(
        seen,
        vec![
            (name_a.replace("duplicati-", "repacked-"), blocks_a, hash_a, size_a),
            (name_b.replace("duplicati-", "repacked-"), blocks_b, hash_b, size_b),
        ]
    );

    let lists: Vec<_> = r.block_lists().unwrap().collect();
    assert_eq!(lists.len(), 1);
    let mut data = Vec::new();
    lists[0].data().unwrap().read_to_end(&mut data).unwrap();
    assert_eq!(data, raw);
}

#[test]
fn dropping_an_unfinished_writer_never_finishes_the_container() {
    let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
    w.start_volume("duplicati-b01.dblock.zst").unwrap();
    w.add_block("AAAA", 4).unwrap();
    let err = w.into_container().err().unwrap();
    assert!(matches!(err, VolumeError::Sequence(_)));
}

#[test]
fn misaligned_blocklist_stream_leaves_no_entry() {
    let alg = HashAlgorithm::Sha256;
    let good = vec![3u8; 64];
    let good_hash = alg.hash_base64(&good);
    let bad = vec![7u8; 32 * 2 + 5];
    let bad_hash = alg.hash_base64(&bad);

    let mut w = IndexVolumeWriter::create(MemoryContainer::new(), options()).unwrap();
    assert!(matches!(
        w.write_blocklist_stream(&bad_hash, &mut bad.as_slice()),
        Err(VolumeError::MalformedBlocklist { len: 69, .. })
    ));
    assert_eq!(w.write_blocklist_stream(&good_hash, &mut good.as_slice()).unwrap(), 64);
    let c = w.into_container().unwrap();
    assert!(!c.file_exists(&format!("list/{}", hash::base64_plain_to_url(&bad_hash))).unwrap());

    let r = IndexVolumeReader::open(c, &options()).unwrap();
    let hashes: Vec<String> = r.block_lists().unwrap().map(|l| l.hash().to_string()).collect();
    assert_eq!(hashes, vec![good_hash]);
}
