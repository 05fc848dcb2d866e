//! Cross-service flows over one shared in-memory backend.

use backoffice::services::networks::{NetworkService, NetworkSettings, NewNetwork};
use backoffice::services::nomenclature::{NewFuelType, NomenclatureService};
use backoffice::services::packages::{PackageService, PackageStatus, PriceLine};
use backoffice::services::prices::PriceService;
use backoffice::services::roles::{NewRole, RoleScope, RoleService};
use backoffice::services::trading_points::{NewTradingPoint, PointType, TradingPointService};
use backoffice::services::users::{AssignmentScope, NewUser, RoleAssignment, UserService};
use backoffice::ServiceError;
use chrono::{Duration, Utc};
use connstore::Db;
use pretty_assertions::assert_eq;
use restdb::MemoryQuerier;
use std::sync::Arc;

fn shared_db() -> Db {
    Db::fixed(Arc::new(MemoryQuerier::new()))
}

fn assignment(code: &str) -> RoleAssignment {
    RoleAssignment {
        role_code: code.into(),
        scope: AssignmentScope::Global,
        scope_id: None,
    }
}

#[tokio::test]
async fn price_package_flow_from_network_to_active_prices() {
    let db = shared_db();
    let networks = NetworkService::new(db.clone());
    let points = TradingPointService::new(db.clone());
    let nomenclature = NomenclatureService::new(db.clone());
    let packages = PackageService::new(db.clone());
    let prices = PriceService::new(db.clone());

    let network = networks
        .create(NewNetwork {
            name: "Nord Oil".into(),
            code: "nord".into(),
            settings: NetworkSettings::default(),
        })
        .await
        .unwrap();
    let point = points
        .create(NewTradingPoint {
            network_id: network.id.clone(),
            name: "Station 17".into(),
            address: "M4 highway, km 212".into(),
            latitude: Some(54.1),
            longitude: Some(38.5),
            point_type: PointType::FuelStation,
            schedule: Some("24/7".into()),
        })
        .await
        .unwrap();
    assert_eq!(points.count_by_network(&network.id).await.unwrap(), 1);

    let ai95 = nomenclature
        .create(NewFuelType {
            code: "ai95".into(),
            name: "AI-95".into(),
            octane: Some(95),
            unit: "l".into(),
            sort_order: 1,
        })
        .await
        .unwrap();

    let draft = packages
        .create_draft(
            &point.id,
            Utc::now() + Duration::hours(1),
            vec![PriceLine {
                fuel_type_id: ai95.id.clone(),
                price_net: 5_320,
                vat_rate: 20.0,
            }],
        )
        .await
        .unwrap();
    packages.schedule(&draft.id).await.unwrap();
    let applied = packages.apply(&draft.id).await.unwrap();
    assert_eq!(applied.status, PackageStatus::Active);

    let active = prices.active_prices(&point.id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].fuel_type_id, ai95.id);
    assert_eq!(active[0].price_gross, 6_384);
}

#[tokio::test]
async fn user_permissions_come_from_assigned_roles() {
    let db = shared_db();
    let roles = RoleService::new(db.clone());
    let users = UserService::new(db.clone());

    roles
        .create(NewRole {
            code: "cashier".into(),
            name: "Cashier".into(),
            scope: RoleScope::Point,
            permissions: vec!["shifts.open".into(), "shifts.close".into()],
        })
        .await
        .unwrap();
    roles
        .create(NewRole {
            code: "pricing".into(),
            name: "Pricing manager".into(),
            scope: RoleScope::Network,
            permissions: vec!["prices.write".into(), "shifts.close".into()],
        })
        .await
        .unwrap();

    let user = users
        .create(NewUser {
            email: "Mila@Example.COM ".into(),
            name: "Mila".into(),
            phone: None,
            roles: vec![assignment("cashier"), assignment("pricing")],
        })
        .await
        .unwrap();
    assert_eq!(user.email, "mila@example.com");

    let mut permissions = users.permissions(&user.id).await.unwrap();
    permissions.sort();
    assert_eq!(
        permissions,
        vec!["prices.write", "shifts.close", "shifts.open"]
    );
}

#[tokio::test]
async fn duplicate_network_code_is_rejected() {
    let db = shared_db();
    let networks = NetworkService::new(db.clone());

    networks
        .create(NewNetwork {
            name: "Nord Oil".into(),
            code: "nord".into(),
            settings: NetworkSettings::default(),
        })
        .await
        .unwrap();
    let err = networks
        .create(NewNetwork {
            name: "Nord Oil Again".into(),
            code: "nord".into(),
            settings: NetworkSettings::default(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}
