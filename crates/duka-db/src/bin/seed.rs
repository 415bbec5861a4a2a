//! # Remote Ledger Seeder
//!
//! Populates a remote ledger database with demo stock, finance accounts
//! and customers so a device agent has something to commit against.
//!
//! ## Usage
//! ```bash
//! # Default: ./duka_remote.db, every catalogue line at 50 units
//! cargo run -p duka-db --bin seed
//!
//! # Custom path and opening stock
//! cargo run -p duka-db --bin seed -- --db ./data/remote.db --stock 200
//! ```
//!
//! Variant ids are stable (`v-{SKU}`) so demo sale payloads can refer to
//! them across reseeds.

use chrono::Utc;
use duka_core::{CustomerAggregate, FinanceAccount, ProductVariant};
use duka_db::{Database, DbConfig};
use std::env;

/// (sku, product, display name)
const CATALOGUE: &[(&str, &str, &str)] = &[
    ("MAIZE-2KG", "maize-flour", "Maize flour 2kg"),
    ("MAIZE-1KG", "maize-flour", "Maize flour 1kg"),
    ("SUGAR-1KG", "sugar", "Sugar 1kg"),
    ("SUGAR-500G", "sugar", "Sugar 500g"),
    ("RICE-5KG", "rice", "Pishori rice 5kg"),
    ("RICE-2KG", "rice", "Pishori rice 2kg"),
    ("OIL-1L", "cooking-oil", "Cooking oil 1L"),
    ("OIL-3L", "cooking-oil", "Cooking oil 3L"),
    ("MILK-500ML", "milk", "Fresh milk 500ml"),
    ("BREAD-400G", "bread", "White bread 400g"),
    ("SOAP-BAR", "soap", "Bar soap"),
    ("TEA-250G", "tea", "Tea leaves 250g"),
];

/// (id, name)
const ACCOUNTS: &[(&str, &str)] = &[
    ("acc-cash", "Cash drawer"),
    ("acc-mpesa", "M-Pesa till"),
    ("acc-bank", "Bank account"),
];

/// (id, name)
const CUSTOMERS: &[(&str, &str)] = &[
    ("cust-amina", "Amina Hassan"),
    ("cust-juma", "Juma Otieno"),
    ("cust-wanjiru", "Wanjiru Kamau"),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut stock: i64 = 50;
    let mut db_path = String::from("./duka_remote.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--stock" | "-s" => {
                if i + 1 < args.len() {
                    stock = args[i + 1].parse().unwrap_or(50);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Duka POS Remote Ledger Seeder");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -s, --stock <N>    Opening stock per variant (default: 50)");
                println!("  -d, --db <PATH>    Database file path (default: ./duka_remote.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Duka POS Remote Ledger Seeder");
    println!("=============================");
    println!("Database: {}", db_path);
    println!("Opening stock: {}", stock);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected, migrations applied");

    let existing = db.inventory().count_variants().await?;
    if existing > 0 {
        println!("⚠ Database already has {} variants", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let now = Utc::now();

    for (sku, product_id, name) in CATALOGUE {
        let variant = ProductVariant {
            id: format!("v-{}", sku),
            product_id: product_id.to_string(),
            sku: sku.to_string(),
            name: name.to_string(),
            quantity: stock,
            updated_at: now,
        };
        if let Err(e) = db.inventory().insert_variant(&variant).await {
            eprintln!("Failed to insert {}: {}", sku, e);
        }
    }
    println!("✓ {} variants", CATALOGUE.len());

    for (id, name) in ACCOUNTS {
        db.finance()
            .insert_account(&FinanceAccount {
                id: id.to_string(),
                name: name.to_string(),
                balance: 0,
                updated_at: now,
            })
            .await?;
    }
    println!("✓ {} finance accounts", ACCOUNTS.len());

    for (id, name) in CUSTOMERS {
        db.customers()
            .insert(&CustomerAggregate {
                id: id.to_string(),
                name: name.to_string(),
                total_spent: 0,
                loyalty_points: 0,
                updated_at: now,
            })
            .await?;
    }
    println!("✓ {} customers", CUSTOMERS.len());

    println!();
    println!("✓ Seed complete!");

    Ok(())
}
