diesel::table! {
    products (id) {
        id -> Uuid,
        name -> Varchar,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    product_variants (id) {
        id -> Uuid,
        product_id -> Uuid,
        sku -> Varchar,
        price -> Numeric,
        attributes -> Jsonb,
        is_active -> Bool,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        order_number -> Varchar,
        user_id -> Uuid,
        address_id -> Uuid,
        status -> Varchar,
        subtotal -> Numeric,
        shipping_cost -> Numeric,
        tax -> Numeric,
        total -> Numeric,
        cancel_reason -> Nullable<Varchar>,
        notes -> Nullable<Text>,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
        reserving -> Bool,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        position -> Int4,
        variant_id -> Uuid,
        product_name -> Varchar,
        unit_price -> Numeric,
        quantity -> Int4,
        variant_attributes -> Jsonb,
    }
}

diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(product_variants -> products (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    orders,
    order_items,
    products,
    product_variants,
);
