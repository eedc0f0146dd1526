// ── MemoryStore: Embedding Blob Codec ──────────────────────────────────────
// Every stored vector carries its provider id and dimension count in a small
// header so that searches never compare vectors from different embedding
// spaces. Layout: [u8 id_len][id bytes][u16le dims][f32le * dims].

/// Encode a vector with its provider header.
pub fn encode_vector(provider_id: &str, vector: &[f32]) -> Vec<u8> {
    let id_bytes = provider_id.as_bytes();
    let id_len = id_bytes.len().min(u8::MAX as usize);
    let mut out = Vec::with_capacity(1 + id_len + 2 + vector.len() * 4);
    out.push(id_len as u8);
    out.extend_from_slice(&id_bytes[..id_len]);
    out.extend_from_slice(&(vector.len() as u16).to_le_bytes());
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode a vector blob. Returns None on any framing mismatch — callers
/// treat an unreadable blob as "no embedding", never as an error.
pub fn decode_vector(blob: &[u8]) -> Option<(String, Vec<f32>)> {
    if blob.is_empty() {
        return None;
    }
    let id_len = blob[0] as usize;
    let dims_start = 1 + id_len;
    if blob.len() < dims_start + 2 {
        return None;
    }
    let provider_id = String::from_utf8(blob[1..dims_start].to_vec()).ok()?;
    let dims = u16::from_le_bytes([blob[dims_start], blob[dims_start + 1]]) as usize;
    let data_start = dims_start + 2;
    if blob.len() != data_start + dims * 4 {
        return None;
    }
    let mut vector = Vec::with_capacity(dims);
    for i in 0..dims {
        let off = data_start + i * 4;
        vector.push(f32::from_le_bytes([blob[off], blob[off + 1], blob[off + 2], blob[off + 3]]));
    }
    Some((provider_id, vector))
}

/// Cosine similarity. Zero when either vector is degenerate or the
/// dimensions differ — mismatched spaces never rank.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Flat exact top-k over candidate blobs: only same-provider, same-dims
/// vectors are compared. Returns (index, score) sorted descending.
pub fn flat_top_k(
    query_provider: &str,
    query: &[f32],
    candidates: &[Option<Vec<u8>>],
    k: usize,
) -> Vec<(usize, f64)> {
    let mut scored: Vec<(usize, f64)> = Vec::new();
    for (idx, blob) in candidates.iter().enumerate() {
        let Some(blob) = blob else { continue };
        let Some((provider, vector)) = decode_vector(blob) else { continue };
        if provider != query_provider || vector.len() != query.len() {
            continue;
        }
        scored.push((idx, cosine_similarity(query, &vector)));
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        let blob = encode_vector("hash-384", &v);
        let (id, decoded) = decode_vector(&blob).unwrap();
        assert_eq!(id, "hash-384");
        assert_eq!(decoded, v);
    }

    #[test]
    fn truncated_blob_is_none() {
        let blob = encode_vector("p", &[1.0, 2.0]);
        assert!(decode_vector(&blob[..blob.len() - 1]).is_none());
        assert!(decode_vector(&[]).is_none());
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn top_k_skips_foreign_providers() {
        let q = vec![1.0f32, 0.0];
        let candidates = vec![
            Some(encode_vector("a", &[1.0, 0.0])),
            Some(encode_vector("b", &[1.0, 0.0])),
            Some(encode_vector("a", &[0.0, 1.0])),
            None,
        ];
        let hits = flat_top_k("a", &q, &candidates, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 0);
    }
}
