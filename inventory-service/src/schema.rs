diesel::table! {
    inventory (id) {
        id -> Uuid,
        variant_id -> Uuid,
        quantity -> Int4,
        reserved_quantity -> Int4,
        low_stock_threshold -> Int4,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    inventory_reservations (id) {
        id -> Uuid,
        order_id -> Uuid,
        line -> Int4,
        variant_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(inventory, inventory_reservations);
