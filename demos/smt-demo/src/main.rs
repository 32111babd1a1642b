//! Sparse Merkle Tree walkthrough
//!
//! Shows:
//! 1. Empty tree proves absence against its default root
//! 2. Numeric-indexed updates leave untouched branches provable
//! 3. Tampered values fail verification
//! 4. Compact proofs drop default side nodes
//! 5. A deep subtree tracks the full tree from proofs alone
//! 6. The prefix-compressed variant stores only divergence points

mod config;

use anyhow::Result;
use smt::{
    Blake3Hasher, CompactSparseMerkleTree, DeepSparseMerkleSubTree, Field, MemoryStore,
    NumIndexSparseMerkleTree, SparseMerkleTree, TreeConfig, TreeHasher,
};
use tracing::info;

use crate::config::DemoConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = DemoConfig::from_env()?;
    info!(height = cfg.height, "starting sparse merkle tree demo");
    let hasher = TreeHasher::shared(Blake3Hasher::default());

    println!("Sparse Merkle Tree demo (height {})\n", cfg.height);

    // 1. Empty tree
    println!("Step 1: empty tree");
    let mut tree =
        NumIndexSparseMerkleTree::<Field, MemoryStore<Field>>::build(MemoryStore::new(), hasher.clone(), cfg.height, true)
            .await?;
    let empty_root = tree.root();
    println!("   Root:            {empty_root}");
    println!("   Default node 0:  {}", hasher.default_nodes(cfg.height)[0]);
    let proof = tree.prove(1u64).await?;
    println!("   Index 1 absent:  {}\n", tree.verify(&proof, None));

    // 2. Numeric-indexed updates
    println!("Step 2: numeric-indexed updates");
    tree.update(0u64, Some(Field::from_u64(33))).await?;
    tree.update(1u64, Some(Field::from_u64(55))).await?;
    let r0 = tree.update(2u64, Some(Field::from_u64(9_999_999))).await?;
    let r1 = tree.update(0u64, Some(Field::from_u64(88))).await?;
    println!("   R0: {r0}");
    println!("   R1: {r1}");
    let value = tree.get(0u64).await?;
    println!("   get(0): {}", value.map(|v| v.to_string()).unwrap_or_else(|| "absent".to_string()));
    let proof = tree.prove(1u64).await?;
    println!("   prove(1) with 55 verifies against R1: {}\n", tree.verify(&proof, Some(&Field::from_u64(55))));

    // 3. Tampering
    println!("Step 3: tampered value");
    let tampered = tree.verify(&proof, Some(&Field::from_u64(56)));
    if tampered {
        println!("   Data is valid");
    } else {
        println!("   Tampering detected, proof does not verify for 56");
    }
    println!();

    // 4. Compact proofs
    println!("Step 4: compact proof");
    let compact = tree.prove_compact(1u64).await?;
    println!(
        "   {} of {} side nodes kept, {} bytes encoded",
        compact.side_nodes.len(),
        cfg.height,
        compact.to_bytes()?.len()
    );
    println!("   JSON: {}\n", serde_json::to_string(&compact)?);

    // 5. Deep subtree
    println!("Step 5: deep subtree");
    let config = TreeConfig::new(cfg.height);
    let mut keyed = SparseMerkleTree::<u64, MemoryStore<u64>>::build(MemoryStore::new(), hasher.clone(), config).await?;
    keyed.update("alice", Some(100)).await?;
    keyed.update("bob", Some(200)).await?;

    let mut subtree = DeepSparseMerkleSubTree::<u64, _>::new(keyed.root(), hasher.clone(), config)?;
    subtree.add_branch(&keyed.prove("alice").await?, "alice", Some(&100))?;
    let full = keyed.update("alice", Some(150)).await?;
    let partial = subtree.update("alice", Some(&150))?;
    println!("   Full tree root: {full}");
    println!("   Subtree root:   {partial}");
    println!("   Roots agree:    {}\n", full == partial);

    // 6. Prefix-compressed variant
    println!("Step 6: prefix-compressed tree");
    let store = MemoryStore::new();
    let mut csmt =
        CompactSparseMerkleTree::<u64, MemoryStore<u64>>::build(store.clone(), hasher, TreeConfig::default()).await?;
    for (i, name) in ["alice", "bob", "carol", "dave"].into_iter().enumerate() {
        csmt.update(name, Some(i as u64)).await?;
    }
    let proof = csmt.prove("carol").await?;
    println!("   Stored nodes:        {}", store.node_count()?);
    println!("   Side nodes for carol: {}", proof.side_nodes.len());
    println!("   carol verifies:      {}", csmt.verify(&proof, "carol", Some(&2)));
    let absent = csmt.prove("mallory").await?;
    println!("   mallory absent:      {}", csmt.verify(&absent, "mallory", None));

    Ok(())
}
